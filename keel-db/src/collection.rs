//! Document read/write path over the commit DAG.
//!
//! Writes produce one field commit per provided field plus the composite
//! roll-up, all staged into a single batch together with the materialized
//! value updates, so readers never observe a partial write. Document keys are
//! content-derived: identical initial content always yields the same key.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use cid::Cid;
use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::ipld::Ipld;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use keel_crdt::{
    lww_wins, CommitLink, CompositeDelta, DocStatus, LwwDelta, LwwState, MerkleDag, WriteSeries,
};
use keel_store::keys;
use keel_store::{Batch, Store};

use crate::error::{DbError, Result};
use crate::schema::{CollectionDescription, FieldDescription};
use crate::value::Value;

/// Prefix of every content-derived document key.
pub const DOCKEY_PREFIX: &str = "bae-";

/// Shared storage context: the KV store, the commit DAG over it, and the
/// per-document write locks serializing composite-head updates.
#[derive(Debug)]
pub struct StoreCtx {
    pub store: Arc<dyn Store>,
    pub dag: MerkleDag,
    doc_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StoreCtx {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let dag = MerkleDag::new(store.clone());
        Self {
            store,
            dag,
            doc_locks: Mutex::new(HashMap::new()),
        }
    }

    fn doc_lock(&self, dockey: &str) -> Arc<Mutex<()>> {
        let mut locks = self.doc_locks.lock();
        locks.entry(dockey.to_string()).or_default().clone()
    }

    /// Materialized document status; `None` when the document was never
    /// created.
    pub fn doc_status(
        &self,
        col: &CollectionDescription,
        dockey: &str,
    ) -> Result<Option<DocStatus>> {
        let key = keys::composite_value_key(col.id, dockey);
        match self.store.get(&key)? {
            Some(bytes) if !bytes.is_empty() => Ok(DocStatus::from_u8(bytes[0])),
            _ => Ok(None),
        }
    }

    /// Materialized value of one field, `Null` when never written.
    pub fn fetch_field(
        &self,
        col: &CollectionDescription,
        dockey: &str,
        field: &FieldDescription,
    ) -> Result<Value> {
        let key = keys::value_key(col.id, dockey, field.id);
        match self.store.get(&key)? {
            None => Ok(Value::Null),
            Some(bytes) => {
                let ipld: Ipld = DagCborCodec
                    .decode(&bytes)
                    .map_err(|err| DbError::MergeConflict(err.to_string()))?;
                Ok(Value::from_ipld(&ipld, field.kind))
            }
        }
    }

    /// Every document key present in the collection, in key order.
    pub fn collection_dockeys(&self, col: &CollectionDescription) -> Result<Vec<String>> {
        let prefix = keys::collection_value_prefix(col.id);
        let mut dockeys: Vec<String> = Vec::new();
        for (key, _) in self.store.scan_prefix(&prefix)? {
            if let Some((dockey, _)) = keys::split_value_key(col.id, &key) {
                if dockeys.last().map(String::as_str) != Some(dockey) {
                    dockeys.push(dockey.to_string());
                }
            }
        }
        Ok(dockeys)
    }

    /// Create a document from its initial field values. Returns the derived
    /// key and the composite commit CID.
    pub fn create_doc(
        &self,
        col: &CollectionDescription,
        values: &[(FieldDescription, Value)],
    ) -> Result<(String, Cid)> {
        let dockey = derive_dockey(&col.schema.name, values)?;
        let lock = self.doc_lock(&dockey);
        let _guard = lock.lock();

        if self.doc_status(col, &dockey)?.is_some() {
            return Err(DbError::DocumentExists(dockey));
        }

        let cid = self.write_fields(col, &dockey, values, DocStatus::Active)?;
        debug!(collection = %col.name, %dockey, %cid, "created document");
        Ok((dockey, cid))
    }

    /// Append field and composite commits updating the given fields.
    pub fn update_doc(
        &self,
        col: &CollectionDescription,
        dockey: &str,
        values: &[(FieldDescription, Value)],
    ) -> Result<Cid> {
        let lock = self.doc_lock(dockey);
        let _guard = lock.lock();
        let cid = self.write_fields(col, dockey, values, DocStatus::Active)?;
        debug!(collection = %col.name, %dockey, %cid, "updated document");
        Ok(cid)
    }

    /// Tombstone a document: a composite commit with no field pointers and
    /// status `Deleted`. The key stays reserved, history stays readable.
    pub fn delete_doc(&self, col: &CollectionDescription, dockey: &str) -> Result<Cid> {
        let lock = self.doc_lock(dockey);
        let _guard = lock.lock();
        let cid = self.write_fields(col, dockey, &[], DocStatus::Deleted)?;
        debug!(collection = %col.name, %dockey, %cid, "deleted document");
        Ok(cid)
    }

    /// The shared write algorithm: per-field commits, composite roll-up,
    /// head swaps and materialized values, one atomic batch.
    fn write_fields(
        &self,
        col: &CollectionDescription,
        dockey: &str,
        values: &[(FieldDescription, Value)],
        status: DocStatus,
    ) -> Result<Cid> {
        let mut batch = Batch::new();
        let version = &col.schema.version_id;

        let mut sorted: Vec<&(FieldDescription, Value)> = values.iter().collect();
        sorted.sort_by(|(a, _), (b, _)| a.name.cmp(&b.name));

        let mut field_cids = BTreeMap::new();
        for (field, value) in sorted {
            let series = WriteSeries::Field(&field.name);
            let heads = self.dag.heads(dockey, series)?;
            let height = heads.iter().map(|head| head.height).max().unwrap_or(0) + 1;
            let delta = LwwDelta::new(height, value.to_ipld()).encode()?;
            let appended = self
                .dag
                .append(&mut batch, dockey, version, series, delta, vec![])?;

            let state = self.lww_state(col.id, dockey, field.id)?;
            if lww_wins(state.as_ref(), height, &appended.cid) {
                let encoded = DagCborCodec
                    .encode(&value.to_ipld())
                    .map_err(|err| DbError::MergeConflict(err.to_string()))?;
                batch.put(
                    keys::value_key(col.id, dockey, field.id).to_vec(),
                    Bytes::from(encoded),
                );
                batch.put(
                    keys::priority_key(col.id, dockey, field.id).to_vec(),
                    encode_priority(height, &appended.cid),
                );
            }
            field_cids.insert(field.name.clone(), appended.cid);
        }

        let series = WriteSeries::Composite;
        let heads = self.dag.heads(dockey, series)?;
        let height = heads.iter().map(|head| head.height).max().unwrap_or(0) + 1;
        let delta = CompositeDelta::new(height, field_cids.clone(), status).encode()?;
        let named = field_cids
            .iter()
            .map(|(name, cid)| CommitLink::named(name.clone(), *cid))
            .collect();
        let appended = self
            .dag
            .append(&mut batch, dockey, version, series, delta, named)?;

        let state = self.composite_state(col.id, dockey)?;
        if lww_wins(state.as_ref(), height, &appended.cid) {
            batch.put(
                keys::composite_value_key(col.id, dockey).to_vec(),
                Bytes::copy_from_slice(&[status.as_u8()]),
            );
            batch.put(
                keys::composite_priority_key(col.id, dockey).to_vec(),
                encode_priority(height, &appended.cid),
            );
        }

        self.store.apply(batch)?;
        Ok(appended.cid)
    }

    fn lww_state(&self, col_id: u32, dockey: &str, field_id: u32) -> Result<Option<LwwState>> {
        let key = keys::priority_key(col_id, dockey, field_id);
        Ok(self.store.get(&key)?.as_deref().and_then(decode_priority))
    }

    fn composite_state(&self, col_id: u32, dockey: &str) -> Result<Option<LwwState>> {
        let key = keys::composite_priority_key(col_id, dockey);
        Ok(self.store.get(&key)?.as_deref().and_then(decode_priority))
    }
}

/// Derive the content-addressed document key: a v5 UUID in the namespace of
/// the schema over the canonical encoding of the initial field values.
pub fn derive_dockey(schema_name: &str, values: &[(FieldDescription, Value)]) -> Result<String> {
    let mut content = BTreeMap::new();
    for (field, value) in values {
        content.insert(field.name.clone(), value.to_ipld());
    }
    let bytes = DagCborCodec
        .encode(&Ipld::Map(content))
        .map_err(|err| DbError::MergeConflict(err.to_string()))?;
    let namespace = Uuid::new_v5(&Uuid::NAMESPACE_URL, schema_name.as_bytes());
    let id = Uuid::new_v5(&namespace, &bytes);
    Ok(format!("{DOCKEY_PREFIX}{id}"))
}

fn encode_priority(height: u64, cid: &Cid) -> Bytes {
    let mut buf = Vec::with_capacity(8 + 40);
    buf.extend_from_slice(&height.to_be_bytes());
    buf.extend_from_slice(&cid.to_bytes());
    Bytes::from(buf)
}

fn decode_priority(bytes: &[u8]) -> Option<LwwState> {
    if bytes.len() < 9 {
        return None;
    }
    let height = u64::from_be_bytes(bytes[..8].try_into().ok()?);
    let cid = Cid::try_from(&bytes[8..]).ok()?;
    Some(LwwState {
        priority: height,
        tie_breaker: cid,
    })
}
