//! Commit DAG and CRDT merge engine.
//!
//! Every document mutation becomes one immutable, content-addressed commit
//! per touched field plus one document-level composite commit. Commits link
//! to the previous heads of their series, forming a per-document Merkle-DAG;
//! concurrent writers produce divergent heads that the next write (or a
//! replicated one) merges by linking to all of them. Per-field CRDT rules
//! make the materialized value independent of arrival order.

pub mod commit;
pub mod composite;
pub mod dag;
pub mod lww;

pub use commit::{Commit, CommitLink};
pub use composite::{CompositeDelta, DocStatus};
pub use dag::{Head, MerkleDag, WriteSeries};
pub use lww::{lww_wins, LwwDelta, LwwState};

use keel_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CrdtError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode commit: {0}")]
    Encode(String),

    #[error("failed to decode block {cid}: {reason}")]
    Decode { cid: cid::Cid, reason: String },

    #[error("corrupt head entry under {0}")]
    CorruptHead(String),
}

pub type Result<T, E = CrdtError> = std::result::Result<T, E>;
