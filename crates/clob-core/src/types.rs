//! Identity, endpoint class, and request fingerprint types.
//!
//! These are the keys that scope every piece of gateway state: sequence
//! counters and rate accounting are per [`Identity`], quotas are per
//! [`EndpointClass`], and in-flight deduplication is per [`Fingerprint`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hex characters kept from the fingerprint digest.
///
/// 16 chars (64 bits) is enough to make accidental collisions between
/// concurrently in-flight requests vanishingly unlikely.
const FINGERPRINT_LEN: usize = 16;

/// Opaque account key scoping sequence allocation and rate accounting.
///
/// Identities are created on first use by each component and removed only
/// by that component's explicit eviction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Create an identity from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Named category of remote operation sharing one quota
/// (e.g. `"order-submit"`, `"market-data-batch"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointClass(String);

impl EndpointClass {
    /// Create an endpoint class from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EndpointClass {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EndpointClass {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Deterministic identifier of a logical request, used to collapse
/// concurrently issued identical requests into one underlying call.
///
/// Two requests with the same endpoint class, identity, and parameters
/// always produce the same fingerprint, regardless of the order in which
/// JSON object keys were assembled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Build a fingerprint from the parts that define a logical request.
    ///
    /// Parameters are canonicalized (object keys sorted recursively) before
    /// hashing so that semantically identical payloads fingerprint equally.
    #[must_use]
    pub fn from_parts(
        endpoint_class: &EndpointClass,
        identity: Option<&Identity>,
        params: &Value,
    ) -> Self {
        let mut canonical = String::new();
        canonical.push_str(endpoint_class.as_str());
        canonical.push('|');
        if let Some(identity) = identity {
            canonical.push_str(identity.as_str());
        }
        canonical.push('|');
        write_canonical(params, &mut canonical);

        let digest = Sha256::digest(canonical.as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(FINGERPRINT_LEN);
        Self(hex)
    }

    /// Borrow the underlying hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serialize a JSON value with object keys sorted recursively.
///
/// `serde_json`'s default map ordering follows insertion order, so two
/// payloads built in different field order would otherwise hash differently.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Display for Value::String emits a quoted, escaped JSON string.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_deterministic() {
        let class = EndpointClass::new("market-data");
        let identity = Identity::new("0xabc");
        let params = json!({"token": "123", "side": "buy"});

        let a = Fingerprint::from_parts(&class, Some(&identity), &params);
        let b = Fingerprint::from_parts(&class, Some(&identity), &params);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_fingerprint_key_order_independent() {
        let class = EndpointClass::new("market-data");
        let mut first = serde_json::Map::new();
        first.insert("a".to_string(), json!(1));
        first.insert("b".to_string(), json!({"y": 2, "x": 1}));

        let mut second = serde_json::Map::new();
        second.insert("b".to_string(), json!({"x": 1, "y": 2}));
        second.insert("a".to_string(), json!(1));

        let a = Fingerprint::from_parts(&class, None, &Value::Object(first));
        let b = Fingerprint::from_parts(&class, None, &Value::Object(second));
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinguishes_parts() {
        let class = EndpointClass::new("market-data");
        let other_class = EndpointClass::new("order-submit");
        let identity = Identity::new("0xabc");
        let params = json!({"token": "123"});

        let base = Fingerprint::from_parts(&class, Some(&identity), &params);
        assert_ne!(
            base,
            Fingerprint::from_parts(&other_class, Some(&identity), &params)
        );
        assert_ne!(base, Fingerprint::from_parts(&class, None, &params));
        assert_ne!(
            base,
            Fingerprint::from_parts(&class, Some(&identity), &json!({"token": "456"}))
        );
    }
}
