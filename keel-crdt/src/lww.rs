//! Last-writer-wins register.
//!
//! The register's clock is the commit height (Lamport-like: every write links
//! to the heads it has seen, so its height exceeds theirs). Ties between
//! concurrent writes of equal height break on the producing commit's CID,
//! greater wins, which makes the merged value independent of apply order.

use std::cmp::Ordering;

use bytes::Bytes;
use cid::Cid;
use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::ipld::Ipld;

use crate::{CrdtError, Result};

/// Persisted merge state for one register: the winning write's priority and
/// the CID that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LwwState {
    pub priority: u64,
    pub tie_breaker: Cid,
}

/// The payload of a field commit: the proposed value at a given priority.
#[derive(Debug, Clone, PartialEq)]
pub struct LwwDelta {
    pub priority: u64,
    pub value: Ipld,
}

impl LwwDelta {
    pub fn new(priority: u64, value: Ipld) -> Self {
        Self { priority, value }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut map = std::collections::BTreeMap::new();
        map.insert("priority".to_string(), Ipld::Integer(self.priority as i128));
        map.insert("value".to_string(), self.value.clone());
        let bytes = DagCborCodec
            .encode(&Ipld::Map(map))
            .map_err(|err| CrdtError::Encode(err.to_string()))?;
        Ok(Bytes::from(bytes))
    }

    pub fn decode(cid: &Cid, bytes: &[u8]) -> Result<Self> {
        let ipld: Ipld = DagCborCodec.decode(bytes).map_err(|err| CrdtError::Decode {
            cid: *cid,
            reason: err.to_string(),
        })?;
        let Ipld::Map(mut map) = ipld else {
            return Err(CrdtError::Decode {
                cid: *cid,
                reason: "lww delta is not a map".to_string(),
            });
        };
        let priority = match map.get("priority") {
            Some(Ipld::Integer(priority)) => *priority as u64,
            _ => {
                return Err(CrdtError::Decode {
                    cid: *cid,
                    reason: "lww delta missing priority".to_string(),
                })
            }
        };
        let value = map.remove("value").ok_or_else(|| CrdtError::Decode {
            cid: *cid,
            reason: "lww delta missing value".to_string(),
        })?;
        Ok(Self { priority, value })
    }
}

/// Whether an incoming write at `(priority, commit_cid)` beats the current
/// register state. `None` current state always loses to the incoming write.
pub fn lww_wins(current: Option<&LwwState>, priority: u64, commit_cid: &Cid) -> bool {
    match current {
        None => true,
        Some(state) => match priority.cmp(&state.priority) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => commit_cid.to_bytes() > state.tie_breaker.to_bytes(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::cid_for;
    use proptest::prelude::*;

    #[test]
    fn higher_priority_wins() {
        let old = cid_for(b"old");
        let new = cid_for(b"new");
        let state = LwwState {
            priority: 3,
            tie_breaker: old,
        };
        assert!(lww_wins(Some(&state), 4, &new));
        assert!(!lww_wins(Some(&state), 2, &new));
    }

    #[test]
    fn ties_break_on_greater_cid() {
        let a = cid_for(b"a");
        let b = cid_for(b"b");
        let (lo, hi) = if a.to_bytes() < b.to_bytes() {
            (a, b)
        } else {
            (b, a)
        };
        let state = LwwState {
            priority: 5,
            tie_breaker: lo,
        };
        assert!(lww_wins(Some(&state), 5, &hi));

        let state = LwwState {
            priority: 5,
            tie_breaker: hi,
        };
        assert!(!lww_wins(Some(&state), 5, &lo));
    }

    #[test]
    fn delta_roundtrip() -> anyhow::Result<()> {
        let delta = LwwDelta::new(7, Ipld::String("Bob".to_string()));
        let bytes = delta.encode()?;
        let cid = cid_for(&bytes);
        assert_eq!(LwwDelta::decode(&cid, &bytes)?, delta);
        Ok(())
    }

    proptest! {
        /// Merging two concurrent writes yields the same winner regardless
        /// of the order they are applied in.
        #[test]
        fn merge_is_order_independent(pa in 1u64..16, pb in 1u64..16, seed_a: u64, seed_b: u64) {
            prop_assume!(seed_a != seed_b);
            let cid_a = cid_for(&seed_a.to_be_bytes());
            let cid_b = cid_for(&seed_b.to_be_bytes());

            // a then b
            let mut state = LwwState { priority: pa, tie_breaker: cid_a };
            if lww_wins(Some(&state), pb, &cid_b) {
                state = LwwState { priority: pb, tie_breaker: cid_b };
            }
            let ab = state;

            // b then a
            let mut state = LwwState { priority: pb, tie_breaker: cid_b };
            if lww_wins(Some(&state), pa, &cid_a) {
                state = LwwState { priority: pa, tie_breaker: cid_a };
            }
            let ba = state;

            prop_assert_eq!(ab, ba);
        }
    }
}
