//! Ordered key-value store contract and the in-memory implementation.
//!
//! Keys sort lexicographically. Scans are prefix-bounded half-open ranges.
//! Batches are collected op lists applied atomically with respect to readers.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::keys::prefix_end;
use crate::{Result, StoreError};

/// Contract over the sorted key-value store backing a database instance.
///
/// The production persistent store is an external collaborator; everything in
/// keel is written against this trait.
pub trait Store: Send + Sync + std::fmt::Debug + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    fn put(&self, key: &[u8], value: Bytes) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Iterate every entry whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<ScanIter>;

    /// Apply a batch of writes atomically: readers observe either none or all
    /// of the contained operations.
    fn apply(&self, batch: Batch) -> Result<()>;
}

/// A single batched operation.
#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Bytes),
    Delete(Vec<u8>),
}

/// An uncommitted set of writes.
///
/// Collect operations with [`Batch::put`] and [`Batch::delete`], then hand the
/// batch to [`Store::apply`]. Dropping the batch (or calling
/// [`Batch::discard`]) abandons it without touching the store.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: Bytes) {
        self.ops.push(Op::Put(key.into(), value));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(Op::Delete(key.into()));
    }

    pub fn discard(&mut self) {
        self.ops.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Owned iterator over a scanned key range.
///
/// Entries are collected at scan time, so the iterator stays valid while the
/// store moves on underneath it.
#[derive(Debug)]
pub struct ScanIter(std::vec::IntoIter<(Vec<u8>, Bytes)>);

impl Iterator for ScanIter {
    type Item = (Vec<u8>, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

/// In-memory store over a `BTreeMap`.
///
/// Writers take the write half of the lock, so [`Store::apply`] is atomic with
/// respect to any concurrent reader.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<RwLock<BTreeMap<Vec<u8>, Bytes>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries, for tests and `dump`.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Snapshot of every entry, used by `Database::dump`.
    pub fn dump(&self) -> Vec<(Vec<u8>, Bytes)> {
        self.inner
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Store for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Bytes) -> Result<()> {
        self.inner.write().insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<ScanIter> {
        let map = self.inner.read();
        let upper = prefix_end(prefix);
        let range = match &upper {
            Some(end) => map.range::<[u8], _>((
                Bound::Included(prefix),
                Bound::Excluded(end.as_slice()),
            )),
            // Prefix of all 0xff bytes: unbounded above.
            None => map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded)),
        };
        let entries: Vec<_> = range.map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(ScanIter(entries.into_iter()))
    }

    fn apply(&self, batch: Batch) -> Result<()> {
        let mut map = self.inner.write();
        for op in batch.ops {
            match op {
                Op::Put(k, v) => {
                    map.insert(k, v);
                }
                Op::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }
}

impl StoreError {
    pub fn kv(err: impl std::fmt::Display) -> Self {
        StoreError::Kv(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn put_get_delete() -> anyhow::Result<()> {
        let store = MemStore::new();
        store.put(b"/a", b("1"))?;
        assert_eq!(store.get(b"/a")?, Some(b("1")));
        store.delete(b"/a")?;
        assert_eq!(store.get(b"/a")?, None);
        Ok(())
    }

    #[test]
    fn scan_is_prefix_bounded_and_ordered() -> anyhow::Result<()> {
        let store = MemStore::new();
        store.put(b"/1/b", b("2"))?;
        store.put(b"/1/a", b("1"))?;
        store.put(b"/2/a", b("3"))?;
        // A key that shares leading bytes but not the prefix segment.
        store.put(b"/10/a", b("4"))?;

        let got: Vec<_> = store.scan_prefix(b"/1/")?.collect();
        assert_eq!(
            got,
            vec![(b"/1/a".to_vec(), b("1")), (b"/1/b".to_vec(), b("2"))]
        );
        Ok(())
    }

    #[test]
    fn batch_applies_all_ops() -> anyhow::Result<()> {
        let store = MemStore::new();
        store.put(b"/x", b("old"))?;

        let mut batch = Batch::new();
        batch.put(b"/y".to_vec(), b("new"));
        batch.delete(b"/x".to_vec());
        store.apply(batch)?;

        assert_eq!(store.get(b"/x")?, None);
        assert_eq!(store.get(b"/y")?, Some(b("new")));
        Ok(())
    }

    #[test]
    fn discarded_batch_is_empty() {
        let mut batch = Batch::new();
        batch.put(b"/x".to_vec(), b("v"));
        batch.discard();
        assert!(batch.is_empty());
    }
}
