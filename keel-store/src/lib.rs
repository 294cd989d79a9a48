//! Storage primitives for keel.
//!
//! Two layers live here: the ordered key-value contract ([`kv::Store`]) with
//! its in-memory implementation, and the content-addressed block store
//! ([`blocks::BlockStore`]) layered on top of it. The [`keys`] module owns the
//! reserved key layout shared by every other crate.

pub mod blocks;
pub mod keys;
pub mod kv;

pub use blocks::{cid_for, BlockStore};
pub use kv::{Batch, MemStore, ScanIter, Store};

/// Errors produced by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A block was requested that is not present in the block store.
    #[error("ipld: could not find {0}")]
    BlockNotFound(cid::Cid),

    /// The block store is append-only.
    #[error("block store does not support deletes")]
    DeleteRejected,

    /// Failure in the underlying key-value store.
    #[error("kv store failure: {0}")]
    Kv(String),

    /// A stored value could not be decoded.
    #[error("corrupt stored value under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
