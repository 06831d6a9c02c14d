//! Ordered key-value backend abstraction
//!
//! The engine consumes any ordered byte-keyed store through [`KvStore`].
//! Stores that can commit many records in one round trip additionally expose
//! [`Batcher`], which the writer detects and prefers. [`MemoryKvStore`] is
//! the ordered in-memory reference implementation used by tests and
//! embedders without a persistent backend.

use crate::error::{Result, VaultError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// One key-value record returned from or handed to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Bytes,
    pub value: Bytes,
}

impl KeyValue {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A group of records staged for a single backend commit
#[derive(Debug, Default)]
pub struct WriteBatch {
    records: Vec<KeyValue>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage one record
    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.records.push(KeyValue::new(key, value));
    }

    /// Drop all staged records
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Consume the batch, yielding its records
    pub fn into_records(self) -> Vec<KeyValue> {
        self.records
    }
}

/// Ordered byte-keyed store. All range bounds are inclusive.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch one value; `None` when the key is absent
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Store one record, replacing any previous value
    async fn put(&self, key: &[u8], value: Bytes) -> Result<()>;

    /// All records with `begin <= key <= end`, in ascending key order
    async fn get_range(&self, begin: &[u8], end: &[u8]) -> Result<Vec<KeyValue>>;

    /// All keys with `begin <= key <= end`, in ascending order
    async fn keys_in_range(&self, begin: &[u8], end: &[u8]) -> Result<Vec<Bytes>>;

    /// Store a group of records in one call
    async fn put_range(&self, records: Vec<KeyValue>) -> Result<()>;

    /// The store's batch capability, when it has one
    fn batcher(&self) -> Option<&dyn Batcher> {
        None
    }
}

/// Batch-commit capability advertised by some stores
#[async_trait]
pub trait Batcher: Send + Sync {
    /// Commit every staged record atomically with respect to readers
    async fn commit(&self, batch: WriteBatch) -> Result<()>;
}

/// Ordered in-memory store backed by a `BTreeMap`
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    map: RwLock<BTreeMap<Vec<u8>, Bytes>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently stored
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.map.read().get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: Bytes) -> Result<()> {
        self.map.write().insert(key.to_vec(), value);
        Ok(())
    }

    async fn get_range(&self, begin: &[u8], end: &[u8]) -> Result<Vec<KeyValue>> {
        if begin > end {
            return Err(VaultError::Backend(
                "range begin sorts after range end".to_string(),
            ));
        }
        let map = self.map.read();
        Ok(map
            .range::<[u8], _>((Bound::Included(begin), Bound::Included(end)))
            .map(|(k, v)| KeyValue::new(Bytes::copy_from_slice(k), v.clone()))
            .collect())
    }

    async fn keys_in_range(&self, begin: &[u8], end: &[u8]) -> Result<Vec<Bytes>> {
        if begin > end {
            return Err(VaultError::Backend(
                "range begin sorts after range end".to_string(),
            ));
        }
        let map = self.map.read();
        Ok(map
            .range::<[u8], _>((Bound::Included(begin), Bound::Included(end)))
            .map(|(k, _)| Bytes::copy_from_slice(k))
            .collect())
    }

    async fn put_range(&self, records: Vec<KeyValue>) -> Result<()> {
        let mut map = self.map.write();
        for record in records {
            map.insert(record.key.to_vec(), record.value);
        }
        Ok(())
    }

    fn batcher(&self) -> Option<&dyn Batcher> {
        Some(self)
    }
}

#[async_trait]
impl Batcher for MemoryKvStore {
    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut map = self.map.write();
        for record in batch.into_records() {
            map.insert(record.key.to_vec(), record.value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_put() {
        let store = MemoryKvStore::new();
        assert_eq!(store.get(b"a").await.unwrap(), None);
        store.put(b"a", Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(store.get(b"a").await.unwrap(), Some(Bytes::from_static(b"1")));
        store.put(b"a", Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(store.get(b"a").await.unwrap(), Some(Bytes::from_static(b"2")));
    }

    #[tokio::test]
    async fn test_range_is_inclusive_and_ordered() {
        let store = MemoryKvStore::new();
        for key in [b"ab", b"aa", b"ad", b"ac", b"ba"] {
            store.put(key, Bytes::copy_from_slice(key)).await.unwrap();
        }
        let records = store.get_range(b"aa", b"ac").await.unwrap();
        let keys: Vec<&[u8]> = records.iter().map(|r| r.key.as_ref()).collect();
        assert_eq!(keys, vec![b"aa".as_ref(), b"ab".as_ref(), b"ac".as_ref()]);

        let keys = store.keys_in_range(b"ac", b"bz").await.unwrap();
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn test_inverted_range_rejected() {
        let store = MemoryKvStore::new();
        assert!(store.get_range(b"b", b"a").await.is_err());
    }

    #[tokio::test]
    async fn test_batch_commit() {
        let store = MemoryKvStore::new();
        let batcher = store.batcher().expect("memory store advertises batching");
        let mut batch = WriteBatch::new();
        batch.put(&b"k1"[..], &b"v1"[..]);
        batch.put(&b"k2"[..], &b"v2"[..]);
        assert_eq!(batch.len(), 2);
        batcher.commit(batch).await.unwrap();
        assert_eq!(store.get(b"k2").await.unwrap(), Some(Bytes::from_static(b"v2")));
    }

    #[test]
    fn test_batch_clear() {
        let mut batch = WriteBatch::new();
        batch.put(&b"k"[..], &b"v"[..]);
        batch.clear();
        assert!(batch.is_empty());
    }
}
