//! The commit record and its canonical encoding.

use std::collections::BTreeMap;

use bytes::Bytes;
use cid::Cid;
use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::ipld::Ipld;

use crate::{CrdtError, Result};

/// A link from a commit to another block.
///
/// `name` is the field name for composite-to-field links, and empty for
/// parent links within a series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitLink {
    pub name: String,
    pub cid: Cid,
}

impl CommitLink {
    pub fn parent(cid: Cid) -> Self {
        Self {
            name: String::new(),
            cid,
        }
    }

    pub fn named(name: impl Into<String>, cid: Cid) -> Self {
        Self {
            name: name.into(),
            cid,
        }
    }

    /// Parent links tie a commit to the previous heads of its own series;
    /// named links point into other series (composite -> field commits).
    pub fn is_parent(&self) -> bool {
        self.name.is_empty()
    }
}

/// An immutable record of a single write.
///
/// A field commit (`field_name = Some`) mutates exactly one field; a
/// composite commit (`field_name = None`) is the document-level roll-up
/// linking the field commits of that write and the prior composite heads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub height: u64,
    pub delta: Bytes,
    pub links: Vec<CommitLink>,
    pub schema_version_id: String,
    pub dockey: String,
    pub field_name: Option<String>,
}

impl Commit {
    /// Canonical DAG-CBOR encoding. Map keys sort, so identical commits
    /// always encode to identical bytes (and identical CIDs).
    pub fn encode(&self) -> Result<Bytes> {
        let mut map = BTreeMap::new();
        map.insert("height".to_string(), Ipld::Integer(self.height as i128));
        map.insert("delta".to_string(), Ipld::Bytes(self.delta.to_vec()));
        map.insert("dockey".to_string(), Ipld::String(self.dockey.clone()));
        map.insert(
            "schemaVersionId".to_string(),
            Ipld::String(self.schema_version_id.clone()),
        );
        if let Some(field) = &self.field_name {
            map.insert("fieldName".to_string(), Ipld::String(field.clone()));
        }
        let links = self
            .links
            .iter()
            .map(|link| {
                let mut entry = BTreeMap::new();
                entry.insert("cid".to_string(), Ipld::Link(link.cid));
                entry.insert("name".to_string(), Ipld::String(link.name.clone()));
                Ipld::Map(entry)
            })
            .collect();
        map.insert("links".to_string(), Ipld::List(links));

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
            return Err(decode_err("commit block is not a map"));
        };

        let height = match map.get("height") {
            Some(Ipld::Integer(height)) => *height as u64,
            _ => return Err(decode_err("missing height")),
        };
        let delta = match map.get("delta") {
            Some(Ipld::Bytes(delta)) => Bytes::from(delta.clone()),
            _ => return Err(decode_err("missing delta")),
        };
        let dockey = match map.get("dockey") {
            Some(Ipld::String(dockey)) => dockey.clone(),
            _ => return Err(decode_err("missing dockey")),
        };
        let schema_version_id = match map.get("schemaVersionId") {
            Some(Ipld::String(id)) => id.clone(),
            _ => return Err(decode_err("missing schemaVersionId")),
        };
        let field_name = match map.get("fieldName") {
            Some(Ipld::String(name)) => Some(name.clone()),
            None => None,
            _ => return Err(decode_err("bad fieldName")),
        };
        let links = match map.get("links") {
            Some(Ipld::List(entries)) => {
                let mut links = Vec::with_capacity(entries.len());
                for entry in entries {
                    let Ipld::Map(entry) = entry else {
                        return Err(decode_err("bad link entry"));
                    };
                    let link_cid = match entry.get("cid") {
                        Some(Ipld::Link(cid)) => *cid,
                        _ => return Err(decode_err("link missing cid")),
                    };
                    let name = match entry.get("name") {
                        Some(Ipld::String(name)) => name.clone(),
                        _ => return Err(decode_err("link missing name")),
                    };
                    links.push(CommitLink { name, cid: link_cid });
                }
                links
            }
            _ => return Err(decode_err("missing links")),
        };

        Ok(Commit {
            height,
            delta,
            links,
            schema_version_id,
            dockey,
            field_name,
        })
    }

    pub fn is_composite(&self) -> bool {
        self.field_name.is_none()
    }

    /// The previous heads of this commit's own series.
    pub fn parent_links(&self) -> impl Iterator<Item = &CommitLink> {
        self.links.iter().filter(|link| link.is_parent())
    }
}
