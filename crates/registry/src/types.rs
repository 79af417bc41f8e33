//! Types for the key registry

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

/// Opaque access key
///
/// Rendered as the canonical hyphenated form of a random 128-bit UUID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessKey(String);

impl AccessKey {
    /// Wrap an existing key string
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Draw a fresh random key
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the key as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Log-safe prefix of the key, see [`key_hint`]
    pub fn hint(&self) -> &str {
        key_hint(&self.0)
    }
}

/// Characters of a key that may appear in logs.
pub const KEY_HINT_CHARS: usize = 8;

/// Leading [`KEY_HINT_CHARS`] characters of `key`.
///
/// Holding a key is enough to rebind it, so logs only ever carry this prefix.
/// Keys no longer than the prefix are hidden entirely.
pub fn key_hint(key: &str) -> &str {
    match key.char_indices().nth(KEY_HINT_CHARS) {
        Some((end, _)) => &key[..end],
        None => "",
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for AccessKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AccessKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A key and the IP address currently bound to it, if any
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub key: AccessKey,
    #[serde(default)]
    pub ip: Option<String>,
}

impl Credential {
    pub fn new(key: AccessKey, ip: Option<String>) -> Self {
        Self { key, ip }
    }
}

/// Process-wide admin secret gating create/list/revoke
#[derive(Clone)]
pub struct AdminSecret(String);

impl AdminSecret {
    /// Returns `None` for an empty secret.
    pub fn new(secret: impl Into<String>) -> Option<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            None
        } else {
            Some(Self(secret))
        }
    }

    /// Exact match against a caller-supplied candidate.
    ///
    /// Every byte is compared regardless of where the first mismatch occurs.
    pub fn verify(&self, candidate: &str) -> bool {
        let expected = self.0.as_bytes();
        let candidate = candidate.as_bytes();
        if expected.len() != candidate.len() {
            return false;
        }
        expected
            .iter()
            .zip(candidate)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Debug for AdminSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AdminSecret(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_is_canonical_uuid() {
        let key = AccessKey::generate();
        assert_eq!(key.as_str().len(), 36);
        let parsed = Uuid::parse_str(key.as_str()).unwrap();
        assert_eq!(parsed.to_string(), key.as_str());
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn test_credential_serializes_absent_ip_as_null() {
        let cred = Credential::new(AccessKey::new("abc"), None);
        let json = serde_json::to_value(&cred).unwrap();
        assert_eq!(json, serde_json::json!({"key": "abc", "ip": null}));
    }

    #[test]
    fn test_key_hint_is_a_short_prefix() {
        let key = AccessKey::new("35c1dbca-1f0e-4c3b-9a51-6d2e8f7a0b19");
        assert_eq!(key.hint(), "35c1dbca");
        assert_eq!(key_hint("short"), "");
        assert_eq!(key_hint("12345678"), "");
        assert_eq!(key_hint("ééééééééé"), "éééééééé");
    }

    #[test]
    fn test_admin_secret_verification() {
        let secret = AdminSecret::new("s3cret").unwrap();
        assert!(secret.verify("s3cret"));
        assert!(!secret.verify("s3cre"));
        assert!(!secret.verify("s3creT"));
        assert!(!secret.verify(""));
        assert!(AdminSecret::new("").is_none());
    }

    #[test]
    fn test_admin_secret_debug_is_redacted() {
        let secret = AdminSecret::new("hunter2").unwrap();
        assert!(!format!("{secret:?}").contains("hunter2"));
    }
}
