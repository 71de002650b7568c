// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Sensitive configuration kept encrypted in memory.
//!
//! Values such as bot tokens, webhook secrets and exchange credentials are
//! sealed with the [`CipherService`] as soon as they are read from the
//! environment. Consumers open a value right before use and drop the
//! plaintext immediately after.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::warn;
use zeroize::Zeroizing;

use super::cipher::{CipherError, CipherService, Decrypted};

pub const TELEGRAM_TOKEN: &str = "TELEGRAM_TOKEN";
pub const ADMIN_ID: &str = "ADMIN_ID";
pub const KOFI_WEBHOOK_TOKEN: &str = "KOFI_WEBHOOK_TOKEN";
pub const BINANCE_WEBHOOK_SECRET: &str = "BINANCE_WEBHOOK_SECRET";
pub const BINANCE_API_KEY: &str = "BINANCE_API_KEY";
pub const BINANCE_API_SECRET: &str = "BINANCE_API_SECRET";
pub const INTERNAL_API_TOKEN: &str = "INTERNAL_API_TOKEN";

/// Named, encrypted configuration values.
#[derive(Debug)]
pub struct SealedSettings {
    cipher: CipherService,
    fields: RwLock<HashMap<String, String>>,
}

impl SealedSettings {
    pub fn new(cipher: CipherService) -> Self {
        Self {
            cipher,
            fields: RwLock::new(HashMap::new()),
        }
    }

    /// Encrypt and store `plaintext` under `name`. Empty values unset the name.
    pub fn seal(&self, name: &str, plaintext: &str) -> Result<(), CipherError> {
        let encrypted = self.cipher.encrypt(plaintext)?;
        let mut fields = self.fields.write().unwrap_or_else(PoisonError::into_inner);
        if encrypted.is_empty() {
            fields.remove(name);
        } else {
            fields.insert(name.to_string(), encrypted);
        }
        Ok(())
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Decrypt the value for `name`.
    ///
    /// Unset names and corrupt values both come back as `None`; corruption is
    /// logged by the cipher.
    pub fn open(&self, name: &str) -> Option<Zeroizing<String>> {
        let encrypted = {
            let fields = self.fields.read().unwrap_or_else(PoisonError::into_inner);
            fields.get(name).cloned()?
        };
        match self.cipher.decrypt(&encrypted) {
            Ok(Decrypted::Plain(value)) => Some(value),
            Ok(Decrypted::Absent) => None,
            Ok(Decrypted::Corrupt) => {
                warn!(setting = %name, "Sealed setting could not be decrypted");
                None
            }
            Err(e) => {
                warn!(setting = %name, error = %e, "Sealed setting unavailable");
                None
            }
        }
    }

    /// Stored ciphertext for `name`, as it would be persisted.
    pub fn ciphertext(&self, name: &str) -> Option<String> {
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}
