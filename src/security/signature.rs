// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Webhook payload signing and validation.
//!
//! The signature is `hex(HMAC-SHA256(secret, canonical_json(payload)))`,
//! where the canonical form is what payment senders produce with Python's
//! `json.dumps(payload, sort_keys=True)`: object keys sorted at every level,
//! `", "` and `": "` separators, and every non-ASCII character escaped as
//! `\uXXXX` (UTF-16 surrogate pairs above the BMP).

use std::io;

use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::{Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Fields every payment webhook must carry.
pub const REQUIRED_FIELDS: [&str; 3] = ["amount", "currency", "user_id"];

/// Formatter matching `json.dumps` defaults (`ensure_ascii=True`).
struct PythonFormatter;

impl Formatter for PythonFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        // Quotes, backslashes and control characters never reach here.
        for c in fragment.chars() {
            if c.is_ascii() && c != '\x7f' {
                writer.write_all(&[c as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

/// Serialize `value` the way `json.dumps(value, sort_keys=True)` does.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    // Rebuilding the tree inserts keys in sorted order, which holds whether
    // or not serde_json's map preserves insertion order.
    let canonical = canonicalize(value);
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, PythonFormatter);
    match canonical.serialize(&mut serializer) {
        Ok(()) => out,
        Err(_) => Vec::new(),
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn mac_over(secret: &[u8], payload: &Value) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(&canonical_json(payload));
    mac.finalize().into_bytes().to_vec()
}

/// Hex signature for `payload`.
pub fn sign(secret: &[u8], payload: &Value) -> String {
    hex::encode(mac_over(secret, payload))
}

/// Check a hex signature in constant time.
pub fn verify_signature(secret: &[u8], payload: &Value, signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };
    let expected = mac_over(secret, payload);
    !expected.is_empty() && bool::from(expected.as_slice().ct_eq(provided.as_slice()))
}

/// Whether every [`REQUIRED_FIELDS`] entry is present and non-null.
pub fn has_required_fields(payload: &Value) -> bool {
    let Some(object) = payload.as_object() else {
        return false;
    };
    REQUIRED_FIELDS
        .iter()
        .all(|field| object.get(*field).is_some_and(|v| !v.is_null()))
}
