// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Subscription plan catalog: price in USDT to days of access.

use serde::Serialize;
use utoipa::ToSchema;

use super::amount::Amount;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Plan {
    pub months: u32,
    #[schema(value_type = String, example = "105")]
    pub price: Amount,
    pub days: u32,
}

#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::new(vec![
            Plan { months: 1, price: Amount::whole(105), days: 30 },
            Plan { months: 2, price: Amount::whole(165), days: 60 },
            Plan { months: 3, price: Amount::whole(280), days: 90 },
            Plan { months: 4, price: Amount::whole(450), days: 120 },
        ])
    }
}

impl PlanCatalog {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self { plans }
    }

    /// Days granted for an exact payment of `price`.
    pub fn days_for(&self, price: Amount) -> Option<u32> {
        self.plans.iter().find(|p| p.price == price).map(|p| p.days)
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prices() {
        let catalog = PlanCatalog::default();
        assert_eq!(catalog.days_for(Amount::whole(105)), Some(30));
        assert_eq!(catalog.days_for(Amount::whole(165)), Some(60));
        assert_eq!(catalog.days_for(Amount::whole(280)), Some(90));
        assert_eq!(catalog.days_for(Amount::whole(450)), Some(120));
        assert_eq!(catalog.days_for(Amount::whole(100)), None);
        assert_eq!(catalog.days_for(Amount::from_micros(105_000_001)), None);
    }
}
