// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Storage error types.

use std::time::Duration;

/// Errors raised by the resilient store and its backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The physical connection is unusable (network drop, server restart).
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("database query error: {0}")]
    Query(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A stored row could not be mapped back into a domain value.
    #[error("stored data is invalid: {0}")]
    Corrupt(String),

    #[error("timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    #[error("connection pool is closed")]
    PoolClosed,

    /// The retry after a pool rebuild also lost its connection.
    #[error("database unavailable after reconnect: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether the error came from the connection rather than the query.
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
