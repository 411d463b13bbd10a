//! Content-addressed memoization of expensive per-key computations.
//!
//! Keys are SHA-256 digests of a canonical JSON encoding, so two inputs that
//! are semantically equal (same maps with keys in a different order) share an
//! entry. Concurrent callers asking for the same missing key run the producer
//! once: each entry is a `OnceCell` that later callers wait on.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::OnceCell;
use tracing::trace;

/// Hex SHA-256 over the canonical JSON form of a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Digest any serializable value.
    pub fn new<K: Serialize + ?Sized>(key: &K) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(key)?;
        Ok(Self::from_json(&value))
    }

    pub fn from_json(value: &Value) -> Self {
        let mut canonical = String::new();
        write_canonical(value, &mut canonical);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compact JSON with object keys sorted at every depth.
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
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub entries: usize,
}

impl CacheStats {
    /// `hits / (hits + misses)`, or 0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Memoizing map from `CacheKey` to `V`.
///
/// A producer error leaves the entry empty so a later call can try again.
/// There is no eviction; entries live until `clear`.
pub struct ContextCache<V> {
    entries: DashMap<CacheKey, Arc<OnceCell<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl<V> Default for ContextCache<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }
}

impl<V: Clone + Send + Sync> ContextCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &CacheKey) -> Arc<OnceCell<V>> {
        self.entries.entry(key.clone()).or_default().clone()
    }

    /// Return the cached value or run `produce` exactly once to fill it.
    ///
    /// Callers that arrive while another caller is producing wait for that
    /// result and count as hits.
    pub async fn get_or_compute<F, Fut, E>(&self, key: &CacheKey, produce: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self.cell(key);
        if let Some(value) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "cache hit");
            return Ok(value.clone());
        }

        let mut produced = false;
        let value = cell
            .get_or_try_init(|| {
                produced = true;
                produce()
            })
            .await?;

        if produced {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.sets.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "cache miss, stored");
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value.clone())
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let value = self
            .entries
            .get(key)
            .and_then(|cell| cell.value().get().cloned());
        match value {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    /// Store `value` unless the key is already filled. Returns whether it was stored.
    pub fn set(&self, key: &CacheKey, value: V) -> bool {
        let stored = self.cell(key).set(value).is_ok();
        if stored {
            self.sets.fetch_add(1, Ordering::Relaxed);
        }
        stored
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|cell| cell.value().initialized())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            entries: self.entries.iter().filter(|e| e.value().initialized()).count(),
        }
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&self) {
        self.entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
    }
}
