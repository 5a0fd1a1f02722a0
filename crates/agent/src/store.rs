//! Remote object store seam.
//!
//! The remote watcher consumes versioned snapshots of one keyed object and
//! writes feedback back with compare-and-set semantics. [`ObjectStore`] is
//! the seam; [`MemoryStore`] backs tests, and [`KubeSecretStore`] speaks the
//! Kubernetes Secret API over plain HTTP (the transport the orchestrator
//! store actually uses), leaning on `metadata.resourceVersion` for the
//! optimistic-locking fence.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::connect::RemoteClient;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("write conflict: object version changed")]
    Conflict,
    #[error("store transport error: {0}")]
    Transport(String),
    #[error("store payload decode error: {0}")]
    Decode(String),
}

/// One versioned snapshot of the remote object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectSnapshot {
    /// Unique identity of the object; changes when the object is deleted
    /// and recreated.
    pub uid: String,
    /// Monotonic version used for the compare-and-set fence.
    pub version: u64,
    /// Byte-string payload keyed by field name.
    pub data: BTreeMap<String, Vec<u8>>,
}

/// Versioned snapshot delivery plus optimistic-locking updates.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the current snapshot, `None` when the object does not exist.
    async fn get(&self) -> Result<Option<ObjectSnapshot>, StoreError>;

    /// Compare-and-set update: applies `snapshot.data` iff the stored
    /// version still equals `snapshot.version`. Returns the stored result.
    async fn update(&self, snapshot: &ObjectSnapshot) -> Result<ObjectSnapshot, StoreError>;

    /// Subscribe to snapshot deliveries. The current snapshot (when the
    /// object exists) is delivered first.
    async fn subscribe(&self) -> Result<mpsc::Receiver<ObjectSnapshot>, StoreError>;
}

// ════════════════════════════════════════════════════════════════════════════
// MEMORY STORE
// ════════════════════════════════════════════════════════════════════════════

/// In-memory store for tests: deterministic versions, no network.
#[derive(Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    object: Option<ObjectSnapshot>,
    subscribers: Vec<mpsc::Sender<ObjectSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Create the object (or replace it wholesale), bumping the version and
    /// notifying subscribers. Returns the new snapshot.
    pub fn seed(&self, uid: &str, data: BTreeMap<String, Vec<u8>>) -> ObjectSnapshot {
        let mut inner = self.inner.lock();
        let version = inner.object.as_ref().map(|o| o.version + 1).unwrap_or(1);
        let snapshot = ObjectSnapshot {
            uid: uid.to_string(),
            version,
            data,
        };
        inner.object = Some(snapshot.clone());
        Self::notify(&mut inner, &snapshot);
        snapshot
    }

    /// Mutate one field out-of-band (an "external writer"), bumping the
    /// version and notifying subscribers.
    pub fn set_field(&self, key: &str, value: &[u8]) -> Option<ObjectSnapshot> {
        let mut inner = self.inner.lock();
        let object = inner.object.as_mut()?;
        object.data.insert(key.to_string(), value.to_vec());
        object.version += 1;
        let snapshot = object.clone();
        Self::notify(&mut inner, &snapshot);
        Some(snapshot)
    }

    /// Current snapshot without going through the trait.
    pub fn current(&self) -> Option<ObjectSnapshot> {
        self.inner.lock().object.clone()
    }

    fn notify(inner: &mut MemoryInner, snapshot: &ObjectSnapshot) {
        inner
            .subscribers
            .retain(|tx| tx.try_send(snapshot.clone()).is_ok());
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self) -> Result<Option<ObjectSnapshot>, StoreError> {
        Ok(self.inner.lock().object.clone())
    }

    async fn update(&self, snapshot: &ObjectSnapshot) -> Result<ObjectSnapshot, StoreError> {
        let mut inner = self.inner.lock();
        let Some(object) = inner.object.as_mut() else {
            return Err(StoreError::Transport("object does not exist".to_string()));
        };
        if object.version != snapshot.version {
            return Err(StoreError::Conflict);
        }
        object.data = snapshot.data.clone();
        object.version += 1;
        let stored = object.clone();
        Self::notify(&mut inner, &stored);
        Ok(stored)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ObjectSnapshot>, StoreError> {
        let (tx, rx) = mpsc::channel(16);
        let mut inner = self.inner.lock();
        if let Some(object) = &inner.object {
            let _ = tx.try_send(object.clone());
        }
        inner.subscribers.push(tx);
        Ok(rx)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// KUBERNETES SECRET STORE
// ════════════════════════════════════════════════════════════════════════════

/// Secret-backed store for one `(namespace, name)` pair.
pub struct KubeSecretStore {
    client: RemoteClient,
    namespace: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct SecretObject {
    metadata: SecretMeta,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SecretMeta {
    #[serde(default)]
    uid: String,
    #[serde(default, rename = "resourceVersion")]
    resource_version: String,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    object: serde_json::Value,
}

impl KubeSecretStore {
    pub fn new(client: RemoteClient, namespace: &str, name: &str) -> Self {
        KubeSecretStore {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn secret_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/secrets/{}",
            self.client.server, self.namespace, self.name
        )
    }

    fn watch_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/secrets?watch=true&fieldSelector=metadata.name%3D{}",
            self.client.server, self.namespace, self.name
        )
    }

    fn decode_secret(value: &serde_json::Value) -> Result<ObjectSnapshot, StoreError> {
        let secret: SecretObject = serde_json::from_value(value.clone())
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut data = BTreeMap::new();
        for (key, encoded) in secret.data {
            let bytes = BASE64
                .decode(encoded)
                .map_err(|e| StoreError::Decode(format!("field {key}: {e}")))?;
            data.insert(key, bytes);
        }
        Ok(ObjectSnapshot {
            uid: secret.metadata.uid,
            // resourceVersion is an opaque decimal in practice; treat
            // unparsable values as 0 rather than failing the snapshot
            version: secret.metadata.resource_version.parse().unwrap_or(0),
            data,
        })
    }

    fn encode_secret(&self, snapshot: &ObjectSnapshot) -> serde_json::Value {
        let data: BTreeMap<&str, String> = snapshot
            .data
            .iter()
            .map(|(key, value)| (key.as_str(), BASE64.encode(value)))
            .collect();
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "uid": snapshot.uid,
                "resourceVersion": snapshot.version.to_string(),
            },
            "data": data,
        })
    }
}

#[async_trait]
impl ObjectStore for KubeSecretStore {
    async fn get(&self) -> Result<Option<ObjectSnapshot>, StoreError> {
        let response = self
            .client
            .http
            .get(self.secret_url())
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StoreError::Transport(format!(
                "get failed with status {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Some(Self::decode_secret(&body)?))
    }

    async fn update(&self, snapshot: &ObjectSnapshot) -> Result<ObjectSnapshot, StoreError> {
        let response = self
            .client
            .http
            .put(self.secret_url())
            .json(&self.encode_secret(snapshot))
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(StoreError::Conflict);
        }
        if !response.status().is_success() {
            return Err(StoreError::Transport(format!(
                "update failed with status {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Self::decode_secret(&body)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ObjectSnapshot>, StoreError> {
        let (tx, rx) = mpsc::channel(16);
        let http = self.client.http.clone();
        let watch_url = self.watch_url();
        let initial = self.get().await?;
        if let Some(snapshot) = initial {
            let _ = tx.try_send(snapshot);
        }

        tokio::spawn(async move {
            loop {
                let response = match http.get(&watch_url).send().await {
                    Ok(response) if response.status().is_success() => response,
                    Ok(response) => {
                        warn!(status = %response.status(), "watch request rejected");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                    Err(err) => {
                        warn!(%err, "watch connection failed");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                // Watch responses are newline-delimited JSON events.
                let mut stream = response.bytes_stream();
                let mut buffer: Vec<u8> = Vec::new();
                while let Some(chunk) = stream.next().await {
                    let Ok(chunk) = chunk else { break };
                    buffer.extend_from_slice(&chunk);
                    while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=newline).collect();
                        let line = &line[..line.len() - 1];
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_slice::<WatchEvent>(line) {
                            Ok(event) if event.event_type == "ADDED" || event.event_type == "MODIFIED" => {
                                match KubeSecretStore::decode_secret(&event.object) {
                                    Ok(snapshot) => {
                                        if tx.send(snapshot).await.is_err() {
                                            return;
                                        }
                                    }
                                    Err(err) => error!(%err, "undecodable watch object"),
                                }
                            }
                            Ok(event) => debug!(event = %event.event_type, "ignoring watch event"),
                            Err(err) => debug!(%err, "skipping unparsable watch line"),
                        }
                    }
                }
                debug!("watch stream ended, re-establishing");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &[u8])]) -> BTreeMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    #[tokio::test]
    async fn memory_store_versions_monotonically() {
        let store = MemoryStore::new();
        assert!(store.get().await.unwrap().is_none());

        let v1 = store.seed("uid-1", data(&[("plan", b"{}")]));
        assert_eq!(v1.version, 1);

        let v2 = store.set_field("extra", b"x").unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(store.get().await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn memory_store_update_enforces_cas() {
        let store = MemoryStore::new();
        let seeded = store.seed("uid-1", data(&[("plan", b"{}")]));

        let mut fresh = seeded.clone();
        fresh.data.insert("k".to_string(), b"v".to_vec());
        let stored = store.update(&fresh).await.unwrap();
        assert_eq!(stored.version, seeded.version + 1);

        // writing against the old version conflicts
        let stale = seeded;
        assert!(matches!(
            store.update(&stale).await,
            Err(StoreError::Conflict)
        ));
    }

    #[tokio::test]
    async fn memory_store_subscription_delivers_current_then_changes() {
        let store = MemoryStore::new();
        store.seed("uid-1", data(&[("plan", b"{}")]));

        let mut rx = store.subscribe().await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.version, 1);

        store.set_field("plan", b"{ }");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.version, 2);
    }

    #[test]
    fn secret_decode_maps_base64_data_and_version() {
        let value = serde_json::json!({
            "metadata": {"uid": "u-1", "resourceVersion": "42"},
            "data": {"plan": BASE64.encode(b"{}"), "empty": ""},
        });
        let snapshot = KubeSecretStore::decode_secret(&value).unwrap();
        assert_eq!(snapshot.uid, "u-1");
        assert_eq!(snapshot.version, 42);
        assert_eq!(snapshot.data["plan"], b"{}");
        assert_eq!(snapshot.data["empty"], b"");
    }

    #[test]
    fn secret_decode_rejects_bad_base64() {
        let value = serde_json::json!({
            "metadata": {"uid": "u-1", "resourceVersion": "1"},
            "data": {"plan": "!!!"},
        });
        assert!(matches!(
            KubeSecretStore::decode_secret(&value),
            Err(StoreError::Decode(_))
        ));
    }

    #[test]
    fn unparsable_resource_version_degrades_to_zero() {
        let value = serde_json::json!({
            "metadata": {"uid": "u-1", "resourceVersion": "not-a-number"},
            "data": {},
        });
        let snapshot = KubeSecretStore::decode_secret(&value).unwrap();
        assert_eq!(snapshot.version, 0);
    }
}
