//! Persistent key-value store for run records, checkpoints and budget counters.
//!
//! Records are JSON values grouped by namespace. `FileStore` keeps one file per
//! record under `<root>/<namespace>/<key>.json` and writes through a temp file
//! plus rename, so a crash never leaves a half-written record behind.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::errors::StoreError;

/// Namespaced JSON record store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError>;

    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError>;

    /// Keys in a namespace, sorted.
    async fn list(&self, namespace: &str) -> Result<Vec<String>, StoreError>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError>;
}

/// Read and deserialize a record.
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn Store,
    namespace: &str,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(namespace, key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StoreError::Serialization {
                namespace: namespace.to_string(),
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Serialize and write a record.
pub async fn put_typed<T: Serialize + ?Sized>(
    store: &dyn Store,
    namespace: &str,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(value).map_err(|source| StoreError::Serialization {
        namespace: namespace.to_string(),
        key: key.to_string(),
        source,
    })?;
    store.put(namespace, key, value).await
}

fn validate_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\0') {
        return Err(StoreError::InvalidKey(segment.to_string()));
    }
    Ok(())
}

/// Namespaces may nest with `/` (e.g. `checkpoints/<run_id>`).
fn validate_namespace(namespace: &str) -> Result<(), StoreError> {
    namespace.split('/').try_for_each(validate_segment)
}

/// In-process store used by tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
        validate_namespace(namespace)?;
        validate_segment(key)?;
        let mut records = self.records.write().await;
        records
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        Ok(records
            .get_mut(namespace)
            .is_some_and(|ns| ns.remove(key).is_some()))
    }
}

/// Directory-backed store.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf, StoreError> {
        validate_namespace(namespace)?;
        Ok(namespace
            .split('/')
            .fold(self.root.clone(), |dir, segment| dir.join(encode_segment(segment))))
    }

    fn record_path(&self, namespace: &str, key: &str) -> Result<PathBuf, StoreError> {
        validate_segment(key)?;
        Ok(self
            .namespace_dir(namespace)?
            .join(format!("{}.json", encode_segment(key))))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.record_path(namespace, key)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Serialization {
                namespace: namespace.to_string(),
                key: key.to_string(),
                source,
            })
    }

    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let dir = self.namespace_dir(namespace)?;
        let path = self.record_path(namespace, key)?;
        tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;

        let content =
            serde_json::to_vec_pretty(&value).map_err(|source| StoreError::Serialization {
                namespace: namespace.to_string(),
                key: key.to_string(),
                source,
            })?;

        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, content).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err(&path))?;
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.namespace_dir(namespace)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir)(e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".json") {
                keys.push(decode_segment(stem));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let path = self.record_path(namespace, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }
}

/// Percent-encode everything outside `[A-Za-z0-9_-]`.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn decode_segment(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let Some(byte) = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            out.push(byte);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    async fn exercise(store: &dyn Store) {
        assert_eq!(store.get("runs", "missing").await.unwrap(), None);
        assert!(store.list("runs").await.unwrap().is_empty());

        store.put("runs", "b", json!({"n": 2})).await.unwrap();
        store.put("runs", "a", json!({"n": 1})).await.unwrap();
        store.put("runs", "a", json!({"n": 3})).await.unwrap();

        assert_eq!(store.get("runs", "a").await.unwrap(), Some(json!({"n": 3})));
        assert_eq!(store.list("runs").await.unwrap(), vec!["a", "b"]);

        assert!(store.delete("runs", "a").await.unwrap());
        assert!(!store.delete("runs", "a").await.unwrap());
        assert_eq!(store.list("runs").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_memory_store_basics() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_basics() {
        let dir = tempdir().unwrap();
        exercise(&FileStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_file_store_encodes_awkward_keys() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let key = "checkpoints/run 1:pre.v2";
        store.put("checkpoints", key, json!(1)).await.unwrap();

        assert_eq!(store.get("checkpoints", key).await.unwrap(), Some(json!(1)));
        assert_eq!(store.list("checkpoints").await.unwrap(), vec![key]);
        // Nothing escapes the namespace directory.
        let files: Vec<_> = std::fs::read_dir(dir.path().join("checkpoints"))
            .unwrap()
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::new(dir.path());
            put_typed(
                &store,
                "runs",
                "r1",
                &Record {
                    name: "alpha".into(),
                    count: 2,
                },
            )
            .await
            .unwrap();
        }

        let reopened = FileStore::new(dir.path());
        let record: Option<Record> = get_typed(&reopened, "runs", "r1").await.unwrap();
        assert_eq!(
            record,
            Some(Record {
                name: "alpha".into(),
                count: 2
            })
        );
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.put("runs", "..", json!(1)).await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.put("", "k", json!(1)).await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.put("checkpoints/../etc", "k", json!(1)).await,
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_nests_namespaces() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.put("checkpoints/run-1", "cp", json!(1)).await.unwrap();
        store.put("checkpoints/run-2", "cp", json!(2)).await.unwrap();

        assert!(dir.path().join("checkpoints/run-1/cp.json").exists());
        assert_eq!(store.list("checkpoints/run-1").await.unwrap(), vec!["cp"]);
        assert_eq!(
            store.get("checkpoints/run-2", "cp").await.unwrap(),
            Some(json!(2))
        );
    }

    #[tokio::test]
    async fn test_get_typed_reports_shape_mismatch() {
        let store = MemoryStore::new();
        store.put("runs", "r1", json!({"name": 5})).await.unwrap();
        let result: Result<Option<Record>, _> = get_typed(&store, "runs", "r1").await;
        assert!(matches!(result, Err(StoreError::Serialization { .. })));
    }

    #[test]
    fn test_segment_encoding_roundtrip() {
        for raw in ["plain", "with space", "a/b", "100%", "ü"] {
            assert_eq!(decode_segment(&encode_segment(raw)), raw);
        }
    }
}
