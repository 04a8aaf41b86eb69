//! Credentials and password hashing.
//!
//! `resolve_credential` is the single place that decides whether a password is
//! sent to the gateway as-is or as its MD5 digest.

use md5::{Digest, Md5};
use std::fmt;

/// String that never shows up in logs or debug output
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<empty>)")
        } else {
            f.write_str("Secret(***)")
        }
    }
}

/// A password plus the flag saying whether it is already a digest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Password {
    pub value: Secret,
    pub hashed: bool,
}

impl Password {
    pub fn new(value: impl Into<String>, hashed: bool) -> Self {
        Self {
            value: Secret::new(value),
            hashed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Account credentials, immutable once loaded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub account_id: String,
    pub account_pwd: Password,
    pub trade_pwd: Password,
    pub unlock_trade_pwd: Password,
    /// Hash unhashed passwords before sending them (`USE_MD5_HASH`)
    pub use_md5: bool,
}

impl Credentials {
    /// Password used to unlock trading; falls back to the trade password
    pub fn unlock_password(&self) -> &Password {
        if self.unlock_trade_pwd.is_empty() {
            &self.trade_pwd
        } else {
            &self.unlock_trade_pwd
        }
    }

    /// Transmittable form of a password under this credential set's hashing mode
    pub fn transmittable(&self, password: &Password) -> String {
        resolve_credential(password.value.expose(), password.hashed, self.use_md5)
    }
}

/// MD5 digest of a password as 32 lowercase hex characters
pub fn md5_hex(password: &str) -> String {
    let digest = Md5::digest(password.as_bytes());
    format!("{:x}", digest)
}

/// Check if a string matches MD5 hash format (32 hex characters)
pub fn is_md5_hash(value: &str) -> bool {
    value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Turn a configured password into the value sent to the gateway.
///
/// * empty passwords stay empty
/// * already-hashed values, or hashing disabled: passthrough
/// * values that already look like an MD5 digest: passthrough with a warning
/// * otherwise: MD5 hex digest
pub fn resolve_credential(raw: &str, already_hashed: bool, use_md5: bool) -> String {
    if raw.is_empty() || already_hashed || !use_md5 {
        return raw.to_string();
    }

    if is_md5_hash(raw) {
        tracing::warn!("Password appears to be an MD5 hash already but IS_PASSWORD_HASHED is false");
        return raw.to_lowercase();
    }

    tracing::debug!("Password hashed with MD5");
    md5_hex(raw)
}
