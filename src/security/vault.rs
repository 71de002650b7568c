// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-memory vault for long-lived decrypted secrets.
//!
//! ## Security Model
//!
//! - Secrets are never persisted; they are loaded once at startup from an
//!   out-of-band source (environment) and live only in process memory.
//! - Every stored buffer is wrapped in [`Zeroizing`], whose drop performs a
//!   volatile write over the bytes, so replaced or erased values are wiped
//!   rather than left for the allocator.
//! - All access goes through a single mutex. The lock is never held across
//!   an `.await`; callers that need a secret for a network call take a
//!   short-lived [`SecretBytes`] copy, which wipes itself on drop.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

/// Name of the master key used by the cipher service.
pub const MASTER_ENCRYPTION: &str = "MASTER_ENCRYPTION";

/// A secret value that is zeroed when dropped.
pub type SecretBytes = Zeroizing<Vec<u8>>;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("secret `{0}` is not loaded")]
    Missing(String),
}

/// Process-wide store of decrypted secrets, keyed by name.
#[derive(Default)]
pub struct SecretVault {
    secrets: Mutex<HashMap<String, SecretBytes>>,
}

impl SecretVault {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SecretBytes>> {
        self.secrets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` under `name`, wiping any previous value first.
    pub fn store(&self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        let name = name.into();
        let value = Zeroizing::new(value.into());
        let mut secrets = self.lock();
        if let Some(mut previous) = secrets.insert(name.clone(), value) {
            previous.zeroize();
            debug!(secret = %name, "Replaced secret");
        }
    }

    /// Copy of the current value for `name`, if any.
    ///
    /// The copy wipes itself on drop; do not keep it beyond the operation
    /// that needs it.
    pub fn get(&self, name: &str) -> Option<SecretBytes> {
        self.lock().get(name).map(|v| Zeroizing::new(v.to_vec()))
    }

    /// Like [`get`](Self::get) but reports a missing secret as an error.
    pub fn require(&self, name: &str) -> Result<SecretBytes, VaultError> {
        self.get(name)
            .ok_or_else(|| VaultError::Missing(name.to_string()))
    }

    /// Run `f` against the secret without copying it out of the vault.
    ///
    /// `f` runs under the vault lock and must not block.
    pub fn with_secret<R>(&self, name: &str, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let secrets = self.lock();
        secrets.get(name).map(|v| f(v.as_slice()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Wipe and remove a single secret. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        match self.lock().remove(name) {
            Some(mut value) => {
                value.zeroize();
                true
            }
            None => false,
        }
    }

    /// Wipe and remove every secret. Returns how many were erased.
    pub fn erase_all(&self) -> usize {
        let mut secrets = self.lock();
        let count = secrets.len();
        for (_, mut value) in secrets.drain() {
            value.zeroize();
        }
        if count > 0 {
            info!(count, "Erased all secrets from vault");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Drop for SecretVault {
    fn drop(&mut self) {
        let secrets = self
            .secrets
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, mut value) in secrets.drain() {
            value.zeroize();
        }
    }
}

impl std::fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.lock().keys().cloned().collect();
        f.debug_struct("SecretVault").field("names", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn store_and_get_roundtrip() {
        let vault = SecretVault::new();
        vault.store(MASTER_ENCRYPTION, b"key-material".to_vec());

        let value = vault.get(MASTER_ENCRYPTION).unwrap();
        assert_eq!(value.as_slice(), b"key-material");
        assert!(vault.contains(MASTER_ENCRYPTION));
    }

    #[test]
    fn store_replaces_previous_value() {
        let vault = SecretVault::new();
        vault.store("API", "first");
        vault.store("API", "second");

        assert_eq!(vault.len(), 1);
        assert_eq!(vault.get("API").unwrap().as_slice(), b"second");
    }

    #[test]
    fn missing_secret_is_absent() {
        let vault = SecretVault::new();
        assert!(vault.get("NOPE").is_none());
        assert!(matches!(vault.require("NOPE"), Err(VaultError::Missing(name)) if name == "NOPE"));
        assert!(vault.with_secret("NOPE", |_| ()).is_none());
    }

    #[test]
    fn erase_all_clears_everything() {
        let vault = SecretVault::new();
        vault.store("A", "1");
        vault.store("B", "2");

        assert_eq!(vault.erase_all(), 2);
        assert!(vault.is_empty());
        assert!(vault.get("A").is_none());
        assert_eq!(vault.erase_all(), 0);
    }

    #[test]
    fn remove_single_secret() {
        let vault = SecretVault::new();
        vault.store("A", "1");
        assert!(vault.remove("A"));
        assert!(!vault.remove("A"));
    }

    #[test]
    fn with_secret_sees_current_value() {
        let vault = SecretVault::new();
        vault.store("K", vec![1u8, 2, 3]);
        let sum = vault.with_secret("K", |bytes| bytes.iter().map(|b| *b as u32).sum::<u32>());
        assert_eq!(sum, Some(6));
    }

    #[test]
    fn debug_output_hides_values() {
        let vault = SecretVault::new();
        vault.store("TOKEN", "super-secret-value");
        let rendered = format!("{vault:?}");
        assert!(rendered.contains("TOKEN"));
        assert!(!rendered.contains("super-secret-value"));
    }

    #[test]
    fn concurrent_writers_leave_one_complete_value() {
        let vault = Arc::new(SecretVault::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let vault = Arc::clone(&vault);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        vault.store("SHARED", vec![i as u8; 32]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let value = vault.get("SHARED").unwrap();
        assert_eq!(value.len(), 32);
        assert!(value.iter().all(|b| *b == value[0]));
    }
}
