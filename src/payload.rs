//! Pluggable stores for oversized request and response bodies.
//!
//! Job arguments should stay small: when a serialized result crosses the
//! configured threshold, its body moves into a payload store and the blob
//! carries a `{"$ref": {"store", "key"}}` reference instead. The callback
//! job resolves the reference transparently and deletes the payload when it
//! is done.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::{Error, Result};

/// Key-value adapter holding JSON payloads keyed by generated string keys.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Fresh key for a new payload. Keys are single-writer: each payload is
    /// written once under a key nobody else holds.
    fn generate_key(&self) -> String {
        Uuid::new_v4().to_string()
    }

    async fn store(&self, key: &str, value: &Value) -> Result<()>;

    async fn fetch(&self, key: &str) -> Result<Option<Value>>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryPayloadStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PayloadStore for MemoryPayloadStore {
    async fn store(&self, key: &str, value: &Value) -> Result<()> {
        self.entries
            .lock()
            .expect("store lock poisoned")
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .entries
            .lock()
            .expect("store lock poisoned")
            .get(key)
            .cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .expect("store lock poisoned")
            .remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .lock()
            .expect("store lock poisoned")
            .contains_key(key))
    }
}

/// Directory-backed store: one `<key>.json` file per payload.
#[derive(Debug, Clone)]
pub struct FilePayloadStore {
    dir: PathBuf,
}

impl FilePayloadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Storage(format!("invalid payload key {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl PayloadStore for FilePayloadStore {
    async fn store(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| Error::Storage(err.to_string()))?;
        let bytes = serde_json::to_vec(value)?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|err| Error::Storage(err.to_string()))
    }

    async fn fetch(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::Storage(err.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Storage(err.to_string())),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(path)
            .await
            .map_err(|err| Error::Storage(err.to_string()))?)
    }
}

/// Shared-KV store over redis with a key prefix and optional TTL.
///
/// When a TTL is set it must exceed the host queue's callback-retry horizon,
/// otherwise a retried callback can find its payload expired.
#[derive(Clone)]
pub struct RedisPayloadStore {
    conn: ConnectionManager,
    prefix: String,
    ttl: Option<Duration>,
}

impl RedisPayloadStore {
    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| Error::Storage(format!("invalid redis url: {err}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|err| Error::Storage(err.to_string()))?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            ttl,
        })
    }

    pub fn with_connection(
        conn: ConnectionManager,
        prefix: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            ttl,
        }
    }

    fn key_for(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl PayloadStore for RedisPayloadStore {
    async fn store(&self, key: &str, value: &Value) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(value)?;
        let key = self.key_for(key);
        match self.ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                conn.set_ex::<_, _, ()>(key, payload, secs)
                    .await
                    .map_err(|err| Error::Storage(err.to_string()))
            }
            None => conn
                .set::<_, _, ()>(key, payload)
                .await
                .map_err(|err| Error::Storage(err.to_string())),
        }
    }

    async fn fetch(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .get(self.key_for(key))
            .await
            .map_err(|err| Error::Storage(err.to_string()))?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key_for(key))
            .await
            .map_err(|err| Error::Storage(err.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(self.key_for(key))
            .await
            .map_err(|err| Error::Storage(err.to_string()))
    }
}

/// Extracts the `$ref` out of a result blob's `body` field, if present.
pub(crate) fn body_ref(blob: &Value) -> Option<(String, String)> {
    let reference = blob.get("body")?.get("$ref")?.as_object()?;
    let store = reference.get("store")?.as_str()?;
    let key = reference.get("key")?.as_str()?;
    Some((store.to_string(), key.to_string()))
}

/// Moves an oversized inline body out of `blob` into the default payload
/// store, substituting the `$ref`. Returns the reference when offloading
/// happened.
pub(crate) async fn offload_body(
    blob: &mut Value,
    config: &Config,
) -> Result<Option<(String, String)>> {
    let serialized_len = serde_json::to_string(&*blob)?.len();
    if serialized_len <= config.payload_store_threshold {
        return Ok(None);
    }

    let Some(body) = blob.get("body").and_then(Value::as_str).map(str::to_string) else {
        return Ok(None);
    };

    let (store_name, store) = config.default_payload_store()?;
    let key = store.generate_key();
    store
        .store(&key, &serde_json::json!({ "body": body }))
        .await?;

    blob["body"] = serde_json::json!({ "$ref": { "store": store_name, "key": key } });
    Ok(Some((store_name, key)))
}

/// Replaces a `$ref` body with the stored payload, in place. Blobs without a
/// reference pass through untouched.
pub(crate) async fn resolve_body_ref(blob: &mut Value, config: &Config) -> Result<()> {
    let Some((store_name, key)) = body_ref(blob) else {
        return Ok(());
    };

    let store = config
        .payload_store(&store_name)
        .ok_or_else(|| Error::UnknownStore(store_name.clone()))?;
    let payload = store
        .fetch(&key)
        .await?
        .ok_or_else(|| Error::MissingPayload {
            store: store_name.clone(),
            key: key.clone(),
        })?;
    let body = payload
        .get("body")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Storage(format!("payload {key:?} has no body field")))?;

    blob["body"] = Value::String(body.to_string());
    Ok(())
}

/// Best-effort idempotent delete of a stored payload.
pub(crate) async fn unstore(store_name: &str, key: &str, config: &Config) {
    let Some(store) = config.payload_store(store_name) else {
        warn!(store = store_name, key, "cannot unstore payload: store not registered");
        return;
    };
    if let Err(err) = store.delete(key).await {
        warn!(store = store_name, key, error = %err, "failed to delete stored payload");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips_and_deletes_idempotently() {
        let store = MemoryPayloadStore::new();
        let key = store.generate_key();
        store.store(&key, &json!({"body": "hello"})).await.unwrap();

        assert!(store.exists(&key).await.unwrap());
        assert_eq!(
            store.fetch(&key).await.unwrap(),
            Some(json!({"body": "hello"}))
        );

        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
        assert_eq!(store.fetch(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FilePayloadStore::new(dir.path());
        let key = store.generate_key();

        store.store(&key, &json!({"body": "filed"})).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(
            store.fetch(&key).await.unwrap(),
            Some(json!({"body": "filed"}))
        );

        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn file_store_rejects_traversal_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FilePayloadStore::new(dir.path());
        assert!(store.fetch("../etc/passwd").await.is_err());
        assert!(store.store("a/b", &json!({})).await.is_err());
    }

    #[test]
    fn body_ref_extracts_store_and_key() {
        let blob = json!({ "body": { "$ref": { "store": "files", "key": "abc" } } });
        assert_eq!(
            body_ref(&blob),
            Some(("files".to_string(), "abc".to_string()))
        );

        assert_eq!(body_ref(&json!({ "body": "inline" })), None);
        assert_eq!(body_ref(&json!({ "status": 200 })), None);
    }
}
