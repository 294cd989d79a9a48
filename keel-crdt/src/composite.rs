//! Document-level composite register.
//!
//! The composite series records document existence and groups the field
//! commits of each write: its delta is the set of `(fieldName, fieldCid)`
//! pointers plus the document status. A tombstone is a composite commit with
//! status `Deleted` and no field pointers.

use std::collections::BTreeMap;

use bytes::Bytes;
use cid::Cid;
use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::ipld::Ipld;

use crate::{CrdtError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocStatus {
    Active,
    Deleted,
}

impl DocStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            DocStatus::Active => 1,
            DocStatus::Deleted => 2,
        }
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(DocStatus::Active),
            2 => Some(DocStatus::Deleted),
            _ => None,
        }
    }
}

/// Payload of a composite commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeDelta {
    pub priority: u64,
    pub fields: BTreeMap<String, Cid>,
    pub status: DocStatus,
}

impl CompositeDelta {
    pub fn new(priority: u64, fields: BTreeMap<String, Cid>, status: DocStatus) -> Self {
        Self {
            priority,
            fields,
            status,
        }
    }

    pub fn tombstone(priority: u64) -> Self {
        Self {
            priority,
            fields: BTreeMap::new(),
            status: DocStatus::Deleted,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut map = BTreeMap::new();
        map.insert("priority".to_string(), Ipld::Integer(self.priority as i128));
        map.insert(
            "status".to_string(),
            Ipld::Integer(self.status.as_u8() as i128),
        );
        let fields = self
            .fields
            .iter()
            .map(|(name, cid)| (name.clone(), Ipld::Link(*cid)))
            .collect::<BTreeMap<_, _>>();
        map.insert("fields".to_string(), Ipld::Map(fields));
        let bytes = DagCborCodec
            .encode(&Ipld::Map(map))
            .map_err(|err| CrdtError::Encode(err.to_string()))?;
        Ok(Bytes::from(bytes))
    }

    pub fn decode(cid: &Cid, bytes: &[u8]) -> Result<Self> {
        let decode_err = |reason: &str| CrdtError::Decode {
            cid: *cid,
            reason: reason.to_string(),
        };
        let ipld: Ipld = DagCborCodec.decode(bytes).map_err(|err| CrdtError::Decode {
            cid: *cid,
            reason: err.to_string(),
        })?;
        let Ipld::Map(map) = ipld else {
            return Err(decode_err("composite delta is not a map"));
        };
        let priority = match map.get("priority") {
            Some(Ipld::Integer(priority)) => *priority as u64,
            _ => return Err(decode_err("missing priority")),
        };
        let status = match map.get("status") {
            Some(Ipld::Integer(status)) => DocStatus::from_u8(*status as u8)
                .ok_or_else(|| decode_err("bad status"))?,
            _ => return Err(decode_err("missing status")),
        };
        let fields = match map.get("fields") {
            Some(Ipld::Map(entries)) => {
                let mut fields = BTreeMap::new();
                for (name, value) in entries {
                    let Ipld::Link(field_cid) = value else {
                        return Err(decode_err("field pointer is not a link"));
                    };
                    fields.insert(name.clone(), *field_cid);
                }
                fields
            }
            _ => return Err(decode_err("missing fields")),
        };
        Ok(Self {
            priority,
            fields,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::cid_for;

    #[test]
    fn roundtrip() -> anyhow::Result<()> {
        let mut fields = BTreeMap::new();
        fields.insert("Age".to_string(), cid_for(b"age commit"));
        fields.insert("Name".to_string(), cid_for(b"name commit"));
        let delta = CompositeDelta::new(1, fields, DocStatus::Active);
        let bytes = delta.encode()?;
        let cid = cid_for(&bytes);
        assert_eq!(CompositeDelta::decode(&cid, &bytes)?, delta);
        Ok(())
    }

    #[test]
    fn tombstone_has_no_fields() -> anyhow::Result<()> {
        let delta = CompositeDelta::tombstone(3);
        assert_eq!(delta.status, DocStatus::Deleted);
        assert!(delta.fields.is_empty());
        let bytes = delta.encode()?;
        let cid = cid_for(&bytes);
        assert_eq!(CompositeDelta::decode(&cid, &bytes)?.status, DocStatus::Deleted);
        Ok(())
    }
}
