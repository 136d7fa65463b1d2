//! Sensitive configuration values and the connection-config contract.
//!
//! Every connector splits its configuration into a non-sensitive
//! connection part and an access part holding credentials. Credentials
//! are wrapped in [`Sensitive`], which masks itself in `Debug`, `Display`
//! and serialized output, so a connection config (or a connector holding
//! one) can be logged or snapshotted without leaking secrets.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Replacement text written wherever a secret would appear.
pub const REDACTED: &str = "*******";

/// A value that must never appear in logs, snapshots or error messages.
///
/// Deserializes transparently from the inner type. Serializes as
/// [`REDACTED`]. Secrets do not take part in equality or hashing, so two
/// configs that differ only in credentials compare equal.
#[derive(Clone, Default)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the secret. Call sites should hand it straight to a client.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> From<T> for Sensitive<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T> fmt::Display for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T> PartialEq for Sensitive<T> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<T> Eq for Sensitive<T> {}

impl<T> Hash for Sensitive<T> {
    fn hash<H: Hasher>(&self, _state: &mut H) {}
}

impl<T> Serialize for Sensitive<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Sensitive<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Sensitive)
    }
}

/// Access configuration for connectors that need no credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoAccess {}

/// Non-sensitive connection settings plus the nested access section.
///
/// Implementors serialize their access section under the `access` key;
/// secrets inside it must be [`Sensitive`].
pub trait ConnectionConfig: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Registry tag of the connector this config belongs to.
    fn connector_type(&self) -> &'static str;

    /// JSON snapshot safe to log: every secret is masked.
    fn redacted(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Key used to cache connections. Excludes the access section entirely,
    /// so rotating a credential does not change which connection is reused.
    fn cache_key(&self) -> String {
        let mut snapshot = self.redacted();
        if let Some(obj) = snapshot.as_object_mut() {
            obj.remove("access");
        }
        let mut hasher = Sha256::new();
        hasher.update(self.connector_type().as_bytes());
        hasher.update(snapshot.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct DemoAccess {
        token: Sensitive<String>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct DemoConnection {
        host: String,
        access: DemoAccess,
    }

    impl ConnectionConfig for DemoConnection {
        fn connector_type(&self) -> &'static str {
            "demo"
        }
    }

    fn demo(token: &str) -> DemoConnection {
        serde_json::from_value(serde_json::json!({
            "host": "db.internal",
            "access": { "token": token }
        }))
        .unwrap()
    }

    #[test]
    fn secrets_never_reach_serialized_or_debug_output() {
        let conn = demo("hunter2-secret");
        assert_eq!(conn.access.token.expose(), "hunter2-secret");

        let json = serde_json::to_string(&conn).unwrap();
        let debug = format!("{:?}", conn);
        let redacted = conn.redacted().to_string();
        for rendered in [&json, &debug, &redacted] {
            assert!(!rendered.contains("hunter2-secret"), "leaked in {}", rendered);
            assert!(rendered.contains(REDACTED));
        }
        assert!(json.contains("db.internal"));
    }

    #[test]
    fn credentials_do_not_affect_equality_or_cache_key() {
        let a = demo("first");
        let b = demo("second");
        assert_eq!(a, b);
        assert_eq!(a.cache_key(), b.cache_key());

        let mut c = demo("first");
        c.host = "other.internal".into();
        assert_ne!(a.cache_key(), c.cache_key());
    }
}
