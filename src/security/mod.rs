// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Secret handling: the in-memory vault, field encryption, sealed settings,
//! audit logging and webhook signatures.

pub mod audit;
pub mod cipher;
pub mod sealed;
pub mod signature;
pub mod vault;

pub use audit::{AuditEvent, AuditEventType, AuditLog};
pub use cipher::{CipherError, CipherService, Decrypted};
pub use sealed::SealedSettings;
pub use vault::{SecretVault, VaultError, MASTER_ENCRYPTION};
