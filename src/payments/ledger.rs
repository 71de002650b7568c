// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Exchange ledger client.
//!
//! The monitor asks the ledger about one transaction id at a time. The
//! Binance implementation queries the signed deposit-history endpoint
//! (`GET /sapi/v1/capital/deposit/hisrec`) filtered by coin and tx id.
//!
//! API credentials stay sealed until the request is built and are dropped
//! (and wiped) as soon as the request is signed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;
use url::Url;

use super::amount::Amount;
use crate::security::sealed::{BINANCE_API_KEY, BINANCE_API_SECRET};
use crate::security::SealedSettings;

pub const DEFAULT_API_BASE_URL: &str = "https://api.binance.com";
const DEPOSIT_HISTORY_PATH: &str = "/sapi/v1/capital/deposit/hisrec";
const RECV_WINDOW_MS: u64 = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger credentials missing: {0}")]
    Credentials(&'static str),
    #[error("ledger request failed: {0}")]
    Request(String),
    #[error("ledger returned HTTP {0}")]
    Status(u16),
    #[error("ledger response was invalid: {0}")]
    InvalidResponse(String),
}

/// A deposit as reported by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerDeposit {
    pub tx_id: String,
    pub asset: String,
    pub amount: Amount,
    pub address: String,
    pub confirmations: u32,
    pub inserted_at: Option<DateTime<Utc>>,
}

/// Source of truth for on-chain deposits.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Look up a single deposit. `Ok(None)` means the ledger has not seen it.
    async fn find_deposit(
        &self,
        asset: &str,
        tx_id: &str,
    ) -> Result<Option<LedgerDeposit>, LedgerError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDeposit {
    amount: String,
    coin: String,
    address: String,
    tx_id: String,
    #[serde(default)]
    confirm_times: Option<String>,
    #[serde(default)]
    insert_time: Option<i64>,
}

/// Parse Binance's `"n/m"` confirmation counter.
fn parse_confirmations(value: Option<&str>) -> u32 {
    value
        .and_then(|v| v.split('/').next())
        .and_then(|n| n.trim().parse().ok())
        .unwrap_or(0)
}

fn into_deposit(raw: RawDeposit) -> Result<LedgerDeposit, LedgerError> {
    let amount = Amount::parse(&raw.amount)
        .map_err(|e| LedgerError::InvalidResponse(format!("amount {}: {e}", raw.amount)))?;
    Ok(LedgerDeposit {
        confirmations: parse_confirmations(raw.confirm_times.as_deref()),
        inserted_at: raw
            .insert_time
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        tx_id: raw.tx_id,
        asset: raw.coin,
        amount,
        address: raw.address,
    })
}

/// Pick the entry for `tx_id` out of a deposit-history response body.
fn select_deposit(body: &str, tx_id: &str) -> Result<Option<LedgerDeposit>, LedgerError> {
    let deposits: Vec<RawDeposit> =
        serde_json::from_str(body).map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
    deposits
        .into_iter()
        .find(|d| d.tx_id == tx_id)
        .map(into_deposit)
        .transpose()
}

/// Binance deposit-history client.
pub struct BinanceLedger {
    base_url: Url,
    settings: Arc<SealedSettings>,
    http: Client,
}

impl BinanceLedger {
    pub fn new(base_url: &str, settings: Arc<SealedSettings>) -> Result<Self, LedgerError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| LedgerError::Request(format!("invalid ledger base URL: {e}")))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| LedgerError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            settings,
            http,
        })
    }

    fn signed_url(&self, asset: &str, tx_id: &str, secret: &[u8]) -> Result<Url, LedgerError> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("coin", asset)
            .append_pair("txId", tx_id)
            .append_pair("recvWindow", &RECV_WINDOW_MS.to_string())
            .append_pair("timestamp", &timestamp)
            .finish();

        let mut mac = Hmac::<Sha256>::new_from_slice(secret)
            .map_err(|_| LedgerError::Credentials(BINANCE_API_SECRET))?;
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let mut url = self
            .base_url
            .join(DEPOSIT_HISTORY_PATH)
            .map_err(|e| LedgerError::Request(e.to_string()))?;
        url.set_query(Some(&format!("{query}&signature={signature}")));
        Ok(url)
    }
}

#[async_trait]
impl Ledger for BinanceLedger {
    async fn find_deposit(
        &self,
        asset: &str,
        tx_id: &str,
    ) -> Result<Option<LedgerDeposit>, LedgerError> {
        let request = {
            let api_key = self
                .settings
                .open(BINANCE_API_KEY)
                .ok_or(LedgerError::Credentials(BINANCE_API_KEY))?;
            let secret = self
                .settings
                .open(BINANCE_API_SECRET)
                .ok_or(LedgerError::Credentials(BINANCE_API_SECRET))?;
            let url = self.signed_url(asset, tx_id, secret.as_bytes())?;
            self.http
                .get(url)
                .header("X-MBX-APIKEY", api_key.as_str())
        };

        let response = request
            .send()
            .await
            .map_err(|e| LedgerError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(LedgerError::Status(status.as_u16()));
        }
        let body = response
            .text()
            .await
            .map_err(|e| LedgerError::Request(e.to_string()))?;

        let deposit = select_deposit(&body, tx_id)?;
        debug!(tx_id = %tx_id, found = deposit.is_some(), "Ledger deposit lookup");
        Ok(deposit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::vault::{SecretVault, MASTER_ENCRYPTION};
    use crate::security::CipherService;

    const BODY: &str = r#"[
        {"amount":"105.00000000","coin":"USDT","network":"TRX","status":1,
         "address":"Taddr","addressTag":"","txId":"tx1","insertTime":1767225600000,
         "transferType":0,"confirmTimes":"3/1","walletType":0},
        {"amount":"0.5","coin":"USDT","network":"TRX","status":0,
         "address":"Tother","txId":"tx2","confirmTimes":"0/1"}
    ]"#;

    #[test]
    fn selects_matching_deposit() {
        let deposit = select_deposit(BODY, "tx1").unwrap().unwrap();
        assert_eq!(deposit.amount, Amount::whole(105));
        assert_eq!(deposit.address, "Taddr");
        assert_eq!(deposit.confirmations, 3);
        assert_eq!(deposit.asset, "USDT");
        assert!(deposit.inserted_at.is_some());

        let pending = select_deposit(BODY, "tx2").unwrap().unwrap();
        assert_eq!(pending.confirmations, 0);
        assert!(select_deposit(BODY, "tx3").unwrap().is_none());
    }

    #[test]
    fn malformed_body_is_invalid() {
        assert!(matches!(
            select_deposit("{\"code\":-1022}", "tx1"),
            Err(LedgerError::InvalidResponse(_))
        ));
        assert!(matches!(
            select_deposit(r#"[{"amount":"x","coin":"USDT","address":"a","txId":"tx1"}]"#, "tx1"),
            Err(LedgerError::InvalidResponse(_))
        ));
    }

    #[test]
    fn confirmation_counter() {
        assert_eq!(parse_confirmations(Some("12/12")), 12);
        assert_eq!(parse_confirmations(Some("1")), 1);
        assert_eq!(parse_confirmations(Some("x/1")), 0);
        assert_eq!(parse_confirmations(None), 0);
    }

    fn ledger(with_credentials: bool) -> BinanceLedger {
        let vault = Arc::new(SecretVault::new());
        vault.store(MASTER_ENCRYPTION, vec![5u8; 32]);
        let settings = Arc::new(SealedSettings::new(CipherService::new(vault)));
        if with_credentials {
            settings.seal(BINANCE_API_KEY, "api-key").unwrap();
            settings.seal(BINANCE_API_SECRET, "api-secret").unwrap();
        }
        BinanceLedger::new("http://127.0.0.1:9", settings).unwrap()
    }

    #[test]
    fn signed_url_carries_hmac_of_query() {
        let url = ledger(true).signed_url("USDT", "tx1", b"api-secret").unwrap();
        assert_eq!(url.path(), DEPOSIT_HISTORY_PATH);

        let query = url.query().unwrap();
        let (unsigned, signature) = query.rsplit_once("&signature=").unwrap();
        assert!(unsigned.starts_with("coin=USDT&txId=tx1&recvWindow=5000&timestamp="));

        let mut mac = Hmac::<Sha256>::new_from_slice(b"api-secret").unwrap();
        mac.update(unsigned.as_bytes());
        assert_eq!(signature, hex::encode(mac.finalize().into_bytes()));
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_request() {
        let err = ledger(false).find_deposit("USDT", "tx1").await.unwrap_err();
        assert!(matches!(err, LedgerError::Credentials(BINANCE_API_KEY)));
    }
}
