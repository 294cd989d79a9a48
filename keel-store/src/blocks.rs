//! Content-addressed block store.
//!
//! Blocks are opaque byte blobs addressed by CIDv1 (DAG-CBOR codec, sha2-256
//! multihash) and persisted under `/blocks/<multihash>`. Puts are idempotent;
//! deletes are rejected, the store is append-only.

use std::sync::Arc;

use bytes::Bytes;
use cid::Cid;
use multihash::{Code, MultihashDigest};

use crate::keys::block_key;
use crate::kv::{Batch, Store};
use crate::{Result, StoreError};

/// Multicodec code for DAG-CBOR.
const DAG_CBOR: u64 = 0x71;

/// The CID a byte string will be stored under.
///
/// Two identical payloads always produce the same CID.
pub fn cid_for(data: &[u8]) -> Cid {
    Cid::new_v1(DAG_CBOR, Code::Sha2_256.digest(data))
}

/// Block store over the shared key-value store.
#[derive(Debug, Clone)]
pub struct BlockStore {
    store: Arc<dyn Store>,
}

impl BlockStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Store a block and return its CID. Re-putting identical bytes is a
    /// no-op that returns the same CID.
    pub fn put(&self, data: Bytes) -> Result<Cid> {
        let cid = cid_for(&data);
        self.store.put(&block_key(&cid), data)?;
        Ok(cid)
    }

    /// Stage a block into `batch` and return the CID it will live under.
    pub fn put_in_batch(&self, batch: &mut Batch, data: Bytes) -> Cid {
        let cid = cid_for(&data);
        batch.put(block_key(&cid).to_vec(), data);
        cid
    }

    pub fn get(&self, cid: &Cid) -> Result<Bytes> {
        self.store
            .get(&block_key(cid))?
            .ok_or(StoreError::BlockNotFound(*cid))
    }

    pub fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.store.get(&block_key(cid))?.is_some())
    }

    /// Blocks are immutable history; deletion is always rejected.
    pub fn delete(&self, _cid: &Cid) -> Result<()> {
        Err(StoreError::DeleteRejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemStore;

    fn block_store() -> BlockStore {
        BlockStore::new(Arc::new(MemStore::new()))
    }

    #[test]
    fn put_is_idempotent_and_cid_stable() -> anyhow::Result<()> {
        let blocks = block_store();
        let payload = Bytes::from_static(b"\xa1cagev\x15");

        let first = blocks.put(payload.clone())?;
        let second = blocks.put(payload.clone())?;
        assert_eq!(first, second);
        assert_eq!(first, cid_for(&payload));
        assert_eq!(blocks.get(&first)?, payload);
        Ok(())
    }

    #[test]
    fn missing_block_error_names_the_cid() {
        let blocks = block_store();
        let cid = cid_for(b"never stored");
        let err = blocks.get(&cid).unwrap_err();
        assert_eq!(err.to_string(), format!("ipld: could not find {cid}"));
    }

    #[test]
    fn deletes_are_rejected() {
        let blocks = block_store();
        let cid = blocks.put(Bytes::from_static(b"data")).unwrap();
        assert!(blocks.delete(&cid).is_err());
        assert!(blocks.has(&cid).unwrap());
    }
}
