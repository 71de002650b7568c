// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Field-level encryption keyed by the vault's master secret.
//!
//! Ciphertext layout (hex encoded): `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! AES-256-GCM provides authentication, so a wrong key, a flipped bit or a
//! truncated value is detected and reported as [`Decrypted::Corrupt`].
//!
//! The empty string is reserved for "unset" in both directions.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64ct::{Base64, Base64Url, Encoding};
use rand::RngCore;
use tracing::warn;
use zeroize::Zeroizing;

use super::vault::{SecretVault, MASTER_ENCRYPTION};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("master encryption key is not available")]
    KeyUnavailable,
    #[error("master encryption key must be {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("master encryption key is not valid base64")]
    InvalidKeyEncoding,
    #[error("encryption failed")]
    Encrypt,
}

/// Outcome of decrypting a stored field.
#[derive(Debug)]
pub enum Decrypted {
    /// The field was empty (unset).
    Absent,
    /// Malformed input or failed authentication.
    Corrupt,
    Plain(Zeroizing<String>),
}

impl Decrypted {
    pub fn into_option(self) -> Option<Zeroizing<String>> {
        match self {
            Decrypted::Plain(value) => Some(value),
            Decrypted::Absent | Decrypted::Corrupt => None,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Decrypted::Corrupt)
    }
}

/// Decode a master key from standard or URL-safe base64.
pub fn decode_master_key(encoded: &str) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let encoded = encoded.trim();
    let bytes = Base64::decode_vec(encoded)
        .or_else(|_| Base64Url::decode_vec(encoded))
        .map_err(|_| CipherError::InvalidKeyEncoding)?;
    let bytes = Zeroizing::new(bytes);
    if bytes.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength(bytes.len()));
    }
    Ok(bytes)
}

/// Generate a fresh random master key, base64 encoded.
pub fn generate_master_key() -> Zeroizing<String> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::thread_rng().fill_bytes(&mut key[..]);
    Zeroizing::new(Base64::encode_string(&key[..]))
}

/// Encrypts and decrypts fields with the vault's `MASTER_ENCRYPTION` key.
///
/// The key is looked up on every call so that rotating the vault entry takes
/// effect immediately and an erased vault stops all crypto.
#[derive(Debug, Clone)]
pub struct CipherService {
    vault: Arc<SecretVault>,
}

impl CipherService {
    pub fn new(vault: Arc<SecretVault>) -> Self {
        Self { vault }
    }

    fn cipher(&self) -> Result<Aes256Gcm, CipherError> {
        self.vault
            .with_secret(MASTER_ENCRYPTION, |key| {
                Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength(key.len()))
            })
            .ok_or(CipherError::KeyUnavailable)?
    }

    /// Encrypt `plaintext` into a hex string. Empty input yields `""`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    /// Decrypt a stored field.
    ///
    /// Only a missing master key is an error; bad input is reported as
    /// [`Decrypted::Corrupt`] and logged.
    pub fn decrypt(&self, field: &str) -> Result<Decrypted, CipherError> {
        if field.is_empty() {
            return Ok(Decrypted::Absent);
        }
        let cipher = self.cipher()?;

        let Ok(bytes) = hex::decode(field) else {
            warn!(len = field.len(), "Invalid encrypted data format");
            return Ok(Decrypted::Corrupt);
        };
        if bytes.len() < NONCE_LEN + TAG_LEN {
            warn!(len = bytes.len(), "Encrypted data too short");
            return Ok(Decrypted::Corrupt);
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = match cipher.decrypt(Nonce::from_slice(nonce_bytes), ciphertext) {
            Ok(plaintext) => Zeroizing::new(plaintext),
            Err(_) => {
                warn!("Decryption failed: authentication error");
                return Ok(Decrypted::Corrupt);
            }
        };

        match std::str::from_utf8(&plaintext) {
            Ok(text) => Ok(Decrypted::Plain(Zeroizing::new(text.to_owned()))),
            Err(_) => {
                warn!("Decrypted data is not valid UTF-8");
                Ok(Decrypted::Corrupt)
            }
        }
    }

    /// Decrypt, collapsing every failure (including a missing key) to `None`.
    pub fn decrypt_opt(&self, field: &str) -> Option<Zeroizing<String>> {
        match self.decrypt(field) {
            Ok(result) => result.into_option(),
            Err(e) => {
                warn!(error = %e, "Decryption unavailable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn service_with_key(key: &[u8]) -> CipherService {
        let vault = Arc::new(SecretVault::new());
        vault.store(MASTER_ENCRYPTION, key.to_vec());
        CipherService::new(vault)
    }

    fn service() -> CipherService {
        service_with_key(&[7u8; KEY_LEN])
    }

    #[test]
    fn roundtrip() {
        let cipher = service();
        let encrypted = cipher.encrypt("123456789:telegram-token").unwrap();
        assert_ne!(encrypted, "123456789:telegram-token");
        assert!(encrypted.chars().all(|c| c.is_ascii_hexdigit()));

        match cipher.decrypt(&encrypted).unwrap() {
            Decrypted::Plain(value) => assert_eq!(value.as_str(), "123456789:telegram-token"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_input_is_unset() {
        let cipher = service();
        assert_eq!(cipher.encrypt("").unwrap(), "");
        assert!(matches!(cipher.decrypt("").unwrap(), Decrypted::Absent));
    }

    #[test]
    fn encrypt_without_key_fails() {
        let cipher = CipherService::new(Arc::new(SecretVault::new()));
        assert!(matches!(cipher.encrypt("x"), Err(CipherError::KeyUnavailable)));
        assert!(matches!(cipher.decrypt("00"), Err(CipherError::KeyUnavailable)));
        assert!(cipher.decrypt_opt("00").is_none());
    }

    #[test]
    fn erased_vault_stops_encryption() {
        let vault = Arc::new(SecretVault::new());
        vault.store(MASTER_ENCRYPTION, vec![1u8; KEY_LEN]);
        let cipher = CipherService::new(Arc::clone(&vault));
        assert!(cipher.encrypt("x").is_ok());

        vault.erase_all();
        assert!(matches!(cipher.encrypt("x"), Err(CipherError::KeyUnavailable)));
    }

    #[test]
    fn wrong_key_is_corrupt() {
        let encrypted = service_with_key(&[1u8; KEY_LEN]).encrypt("secret").unwrap();
        let other = service_with_key(&[2u8; KEY_LEN]);
        assert!(other.decrypt(&encrypted).unwrap().is_corrupt());
    }

    #[test]
    fn malformed_input_is_corrupt() {
        let cipher = service();
        assert!(cipher.decrypt("not-hex").unwrap().is_corrupt());
        assert!(cipher.decrypt("abcd").unwrap().is_corrupt());

        let mut encrypted = cipher.encrypt("secret").unwrap().into_bytes();
        let last = encrypted.len() - 1;
        encrypted[last] = if encrypted[last] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(encrypted).unwrap();
        assert!(cipher.decrypt(&tampered).unwrap().is_corrupt());
    }

    #[test]
    fn nonces_differ_between_calls() {
        let cipher = service();
        assert_ne!(cipher.encrypt("same").unwrap(), cipher.encrypt("same").unwrap());
    }

    #[test]
    fn short_key_is_rejected() {
        let cipher = service_with_key(&[1u8; 16]);
        assert!(matches!(cipher.encrypt("x"), Err(CipherError::InvalidKeyLength(16))));
    }

    #[test]
    fn master_key_decoding() {
        let generated = generate_master_key();
        assert_eq!(decode_master_key(&generated).unwrap().len(), KEY_LEN);

        // URL-safe keys (as produced by Fernet tooling) are accepted too.
        let url_safe = Base64Url::encode_string(&[0xfbu8; KEY_LEN]);
        assert_eq!(decode_master_key(&url_safe).unwrap().as_slice(), &[0xfbu8; KEY_LEN]);

        assert!(matches!(
            decode_master_key(&Base64::encode_string(&[0u8; 8])),
            Err(CipherError::InvalidKeyLength(8))
        ));
        assert!(matches!(
            decode_master_key("***"),
            Err(CipherError::InvalidKeyEncoding)
        ));
    }

    proptest! {
        #[test]
        fn decrypt_inverts_encrypt(plaintext in "\\PC{1,64}") {
            let cipher = service();
            let encrypted = cipher.encrypt(&plaintext).unwrap();
            let decrypted = cipher.decrypt(&encrypted).unwrap().into_option().unwrap();
            prop_assert_eq!(decrypted.as_str(), plaintext.as_str());
        }
    }
}
