//! Transient, lazily created vendor client handles.
//!
//! A connector owns exactly one [`ClientHandle`]. The first unit that
//! needs the client creates it; every later unit dispatched through the
//! same connector instance reuses it. The handle is never part of a
//! connector's persisted state: it serializes as `null`, and a
//! deserialized handle is *detached* until [`ClientHandle::reconnect`]
//! is called.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::future::Future;
use tokio::sync::OnceCell;

use crate::error::{IngestError, Result};

pub struct ClientHandle<C> {
    cell: OnceCell<C>,
    detached: bool,
}

impl<C> ClientHandle<C> {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            detached: false,
        }
    }

    /// A handle that refuses to connect until [`reconnect`](Self::reconnect).
    pub fn detached() -> Self {
        Self {
            cell: OnceCell::new(),
            detached: true,
        }
    }

    /// Return the memoized client, creating it with `init` on first use.
    ///
    /// Concurrent callers wait for a single initialization. A failed
    /// initialization is not cached; the next caller tries again.
    pub async fn get_or_connect<F, Fut>(&self, init: F) -> Result<&C>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        if self.detached {
            return Err(IngestError::Config(
                "client handle was restored from a snapshot; call reconnect() before use".into(),
            ));
        }
        self.cell.get_or_try_init(init).await
    }

    /// The client, if one has been created.
    pub fn get(&self) -> Option<&C> {
        self.cell.get()
    }

    pub fn is_connected(&self) -> bool {
        self.cell.initialized()
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Drop any live client and allow lazy creation again.
    pub fn reconnect(&mut self) {
        self.cell = OnceCell::new();
        self.detached = false;
    }
}

impl<C> Default for ClientHandle<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for ClientHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("connected", &self.is_connected())
            .field("detached", &self.detached)
            .finish()
    }
}

impl<C> Serialize for ClientHandle<C> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_none()
    }
}

impl<'de, C> Deserialize<'de> for ClientHandle<C> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde::de::IgnoredAny::deserialize(deserializer)?;
        Ok(Self::detached())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Serialize, Deserialize)]
    struct Holder {
        name: String,
        #[serde(default = "ClientHandle::detached")]
        client: ClientHandle<String>,
    }

    #[tokio::test]
    async fn client_is_created_once() {
        let handle: ClientHandle<String> = ClientHandle::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let client = handle
                .get_or_connect(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("conn".to_string())
                })
                .await
                .unwrap();
            assert_eq!(client, "conn");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn failed_init_is_not_memoized() {
        let handle: ClientHandle<String> = ClientHandle::new();
        let err = handle
            .get_or_connect(|| async { Err(IngestError::SourceConnection("down".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::SourceConnection(_)));
        assert!(!handle.is_connected());
        let ok = handle.get_or_connect(|| async { Ok("up".to_string()) }).await;
        assert_eq!(ok.unwrap(), "up");
    }

    #[tokio::test]
    async fn snapshot_nulls_client_and_requires_reconnect() {
        let holder = Holder {
            name: "dest".into(),
            client: ClientHandle::new(),
        };
        holder
            .client
            .get_or_connect(|| async { Ok("live".to_string()) })
            .await
            .unwrap();

        let json = serde_json::to_value(&holder).unwrap();
        assert_eq!(json["client"], serde_json::Value::Null);

        let mut restored: Holder = serde_json::from_value(json).unwrap();
        assert!(restored.client.is_detached());
        let err = restored
            .client
            .get_or_connect(|| async { Ok("again".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));

        restored.client.reconnect();
        let client = restored
            .client
            .get_or_connect(|| async { Ok("again".to_string()) })
            .await
            .unwrap();
        assert_eq!(client, "again");
    }
}
