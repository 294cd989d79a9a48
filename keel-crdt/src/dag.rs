//! Per-document commit DAG: appends, head tracking, traversal.
//!
//! Heads are tracked per `(dockey, series)` where a series is either a field
//! name or the composite marker. Appending links the new commit to every
//! current head of its series, swaps the head markers inside the caller's
//! batch, and leaves block + head writes to commit atomically together.

use std::collections::HashSet;

use bytes::Bytes;
use cid::Cid;
use keel_store::keys::{self, COMPOSITE_FIELD};
use keel_store::{Batch, BlockStore, Store};
use tracing::trace;

use crate::commit::{Commit, CommitLink};
use crate::{CrdtError, Result};

/// The series a commit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSeries<'a> {
    Field(&'a str),
    Composite,
}

impl<'a> WriteSeries<'a> {
    fn marker(&self) -> &str {
        match self {
            WriteSeries::Field(name) => name,
            WriteSeries::Composite => COMPOSITE_FIELD,
        }
    }

    fn field_name(&self) -> Option<String> {
        match self {
            WriteSeries::Field(name) => Some((*name).to_string()),
            WriteSeries::Composite => None,
        }
    }
}

/// A current head of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    pub cid: Cid,
    pub height: u64,
}

/// Outcome of appending one commit.
#[derive(Debug, Clone)]
pub struct Appended {
    pub cid: Cid,
    pub commit: Commit,
}

#[derive(Debug, Clone)]
pub struct MerkleDag {
    store: std::sync::Arc<dyn Store>,
    blocks: BlockStore,
}

impl MerkleDag {
    pub fn new(store: std::sync::Arc<dyn Store>) -> Self {
        let blocks = BlockStore::new(store.clone());
        Self { store, blocks }
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    /// Current heads of a series, unordered.
    pub fn heads(&self, dockey: &str, series: WriteSeries<'_>) -> Result<Vec<Head>> {
        let prefix = keys::head_prefix(dockey, series.marker());
        let mut heads = Vec::new();
        for (key, value) in self.store.scan_prefix(&prefix)? {
            let suffix = &key[prefix.len()..];
            let text = std::str::from_utf8(suffix)
                .map_err(|_| CrdtError::CorruptHead(String::from_utf8_lossy(&key).into_owned()))?;
            let cid: Cid = text
                .parse()
                .map_err(|_| CrdtError::CorruptHead(text.to_string()))?;
            let height = decode_height(&value)
                .ok_or_else(|| CrdtError::CorruptHead(text.to_string()))?;
            heads.push(Head { cid, height });
        }
        Ok(heads)
    }

    /// Append a commit to `series`, linking every current head as a parent.
    ///
    /// The commit block and the head swap are staged into `batch`; nothing is
    /// visible until the caller applies it. The new height is
    /// `1 + max(parent heights)`, or `1` for the first commit of the series.
    pub fn append(
        &self,
        batch: &mut Batch,
        dockey: &str,
        schema_version_id: &str,
        series: WriteSeries<'_>,
        delta: Bytes,
        named_links: Vec<CommitLink>,
    ) -> Result<Appended> {
        let parents = self.heads(dockey, series)?;
        let height = parents.iter().map(|head| head.height).max().unwrap_or(0) + 1;

        let mut links: Vec<CommitLink> =
            parents.iter().map(|head| CommitLink::parent(head.cid)).collect();
        // Deterministic link order independent of head scan order.
        links.sort_by_key(|link| link.cid.to_bytes());
        links.extend(named_links);

        let commit = Commit {
            height,
            delta,
            links,
            schema_version_id: schema_version_id.to_string(),
            dockey: dockey.to_string(),
            field_name: series.field_name(),
        };
        let bytes = commit.encode()?;
        let cid = self.blocks.put_in_batch(batch, bytes);

        for head in &parents {
            batch.delete(keys::head_key(dockey, series.marker(), &head.cid).to_vec());
        }
        batch.put(
            keys::head_key(dockey, series.marker(), &cid).to_vec(),
            Bytes::copy_from_slice(&height.to_be_bytes()),
        );

        trace!(%dockey, series = series.marker(), %cid, height, "appended commit");
        Ok(Appended { cid, commit })
    }

    /// Load and decode a commit by CID. `Ok(None)` when the block is absent.
    pub fn get_commit(&self, cid: &Cid) -> Result<Option<Commit>> {
        match self.blocks.get(cid) {
            Ok(bytes) => Ok(Some(Commit::decode(cid, &bytes)?)),
            Err(keel_store::StoreError::BlockNotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Commits currently heading the composite series, with their records.
    pub fn head_commits(&self, dockey: &str) -> Result<Vec<(Cid, Commit)>> {
        let mut out = Vec::new();
        for head in self.heads(dockey, WriteSeries::Composite)? {
            if let Some(commit) = self.get_commit(&head.cid)? {
                out.push((head.cid, commit));
            }
        }
        out.sort_by(|(a, _), (b, _)| a.to_bytes().cmp(&b.to_bytes()));
        Ok(out)
    }

    /// Every composite commit reachable from the current composite heads.
    ///
    /// The order is canonical: height descending, ties broken by CID
    /// ascending, so the result is deterministic regardless of the order
    /// commits arrived in.
    pub fn walk_composite(&self, dockey: &str) -> Result<Vec<(Cid, Commit)>> {
        let mut queue: Vec<Cid> = self
            .heads(dockey, WriteSeries::Composite)?
            .iter()
            .map(|head| head.cid)
            .collect();
        let mut seen: HashSet<Cid> = queue.iter().copied().collect();
        let mut commits = Vec::new();

        while let Some(cid) = queue.pop() {
            let Some(commit) = self.get_commit(&cid)? else {
                continue;
            };
            for link in commit.parent_links() {
                if seen.insert(link.cid) {
                    queue.push(link.cid);
                }
            }
            commits.push((cid, commit));
        }

        commits.sort_by(|(cid_a, a), (cid_b, b)| {
            b.height
                .cmp(&a.height)
                .then_with(|| cid_a.to_bytes().cmp(&cid_b.to_bytes()))
        });
        Ok(commits)
    }
}

fn decode_height(value: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = value.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::MemStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::composite::{CompositeDelta, DocStatus};
    use crate::lww::LwwDelta;
    use libipld::ipld::Ipld;

    const SCHEMA: &str = "bafyschemaversion";
    const DOC: &str = "bae-test-doc";

    fn dag_and_store() -> (MerkleDag, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        (MerkleDag::new(store.clone()), store)
    }

    fn write_field(
        dag: &MerkleDag,
        store: &MemStore,
        field: &str,
        value: Ipld,
    ) -> anyhow::Result<Appended> {
        let mut batch = Batch::new();
        let heads = dag.heads(DOC, WriteSeries::Field(field))?;
        let height = heads.iter().map(|h| h.height).max().unwrap_or(0) + 1;
        let delta = LwwDelta::new(height, value).encode()?;
        let appended = dag.append(
            &mut batch,
            DOC,
            SCHEMA,
            WriteSeries::Field(field),
            delta,
            vec![],
        )?;
        keel_store::Store::apply(store, batch)?;
        Ok(appended)
    }

    fn write_composite(
        dag: &MerkleDag,
        store: &MemStore,
        fields: BTreeMap<String, Cid>,
    ) -> anyhow::Result<Appended> {
        let mut batch = Batch::new();
        let named = fields
            .iter()
            .map(|(name, cid)| CommitLink::named(name.clone(), *cid))
            .collect();
        let delta = CompositeDelta::new(1, fields, DocStatus::Active).encode()?;
        let appended = dag.append(
            &mut batch,
            DOC,
            SCHEMA,
            WriteSeries::Composite,
            delta,
            named,
        )?;
        keel_store::Store::apply(store, batch)?;
        Ok(appended)
    }

    #[test]
    fn first_commit_has_height_one_and_becomes_head() -> anyhow::Result<()> {
        let (dag, store) = dag_and_store();
        let appended = write_field(&dag, &store, "Age", Ipld::Integer(21))?;

        assert_eq!(appended.commit.height, 1);
        let heads = dag.heads(DOC, WriteSeries::Field("Age"))?;
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].cid, appended.cid);
        assert_eq!(heads[0].height, 1);
        Ok(())
    }

    #[test]
    fn appending_replaces_parents_in_head_set() -> anyhow::Result<()> {
        let (dag, store) = dag_and_store();
        let first = write_field(&dag, &store, "Age", Ipld::Integer(21))?;
        let second = write_field(&dag, &store, "Age", Ipld::Integer(22))?;

        assert_eq!(second.commit.height, 2);
        let parent_cids: Vec<_> = second.commit.parent_links().map(|l| l.cid).collect();
        assert_eq!(parent_cids, vec![first.cid]);

        let heads = dag.heads(DOC, WriteSeries::Field("Age"))?;
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].cid, second.cid);
        Ok(())
    }

    #[test]
    fn divergent_heads_are_both_retained_then_merged() -> anyhow::Result<()> {
        let (dag, store) = dag_and_store();
        let base = write_field(&dag, &store, "Age", Ipld::Integer(21))?;

        // Two concurrent writers both linking to `base`: simulate by
        // appending the second before the store learns about the first's
        // head swap.
        let mut batch_a = Batch::new();
        let delta_a = LwwDelta::new(2, Ipld::Integer(22)).encode()?;
        let a = dag.append(&mut batch_a, DOC, SCHEMA, WriteSeries::Field("Age"), delta_a, vec![])?;
        let mut batch_b = Batch::new();
        let delta_b = LwwDelta::new(2, Ipld::Integer(23)).encode()?;
        let b = dag.append(&mut batch_b, DOC, SCHEMA, WriteSeries::Field("Age"), delta_b, vec![])?;
        keel_store::Store::apply(&*store, batch_a)?;
        keel_store::Store::apply(&*store, batch_b)?;

        // The base head was deleted by both appends; both successors remain.
        let heads = dag.heads(DOC, WriteSeries::Field("Age"))?;
        let mut head_cids: Vec<_> = heads.iter().map(|h| h.cid).collect();
        head_cids.sort_by_key(|c| c.to_bytes());
        let mut expected = vec![a.cid, b.cid];
        expected.sort_by_key(|c| c.to_bytes());
        assert_eq!(head_cids, expected);
        assert!(!head_cids.contains(&base.cid));

        // The next write links both divergent heads and collapses the set.
        let merged = write_field(&dag, &store, "Age", Ipld::Integer(24))?;
        assert_eq!(merged.commit.height, 3);
        assert_eq!(merged.commit.parent_links().count(), 2);
        let heads = dag.heads(DOC, WriteSeries::Field("Age"))?;
        assert_eq!(heads.len(), 1);
        Ok(())
    }

    #[test]
    fn walk_is_height_desc_cid_asc_and_topological() -> anyhow::Result<()> {
        let (dag, store) = dag_and_store();

        let age = write_field(&dag, &store, "Age", Ipld::Integer(21))?;
        let mut fields = BTreeMap::new();
        fields.insert("Age".to_string(), age.cid);
        let first = write_composite(&dag, &store, fields)?;

        let age2 = write_field(&dag, &store, "Age", Ipld::Integer(22))?;
        let mut fields = BTreeMap::new();
        fields.insert("Age".to_string(), age2.cid);
        let second = write_composite(&dag, &store, fields)?;

        let commits = dag.walk_composite(DOC)?;
        let heights: Vec<_> = commits.iter().map(|(_, c)| c.height).collect();
        assert_eq!(heights, vec![2, 1]);
        assert_eq!(commits[0].0, second.cid);
        assert_eq!(commits[1].0, first.cid);

        // No commit may appear before one of its parent links.
        for (idx, (_, commit)) in commits.iter().enumerate() {
            for link in commit.parent_links() {
                let parent_pos = commits.iter().position(|(cid, _)| *cid == link.cid);
                if let Some(pos) = parent_pos {
                    assert!(pos > idx, "parent emitted before child");
                }
            }
        }

        // Head set is the single latest composite.
        let heads = dag.heads(DOC, WriteSeries::Composite)?;
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].cid, second.cid);
        Ok(())
    }

    #[test]
    fn walk_is_deterministic_across_runs() -> anyhow::Result<()> {
        let (dag, store) = dag_and_store();
        for age in 20..25 {
            let field = write_field(&dag, &store, "Age", Ipld::Integer(age))?;
            let mut fields = BTreeMap::new();
            fields.insert("Age".to_string(), field.cid);
            write_composite(&dag, &store, fields)?;
        }
        let first_run: Vec<_> = dag.walk_composite(DOC)?.iter().map(|(c, _)| *c).collect();
        let second_run: Vec<_> = dag.walk_composite(DOC)?.iter().map(|(c, _)| *c).collect();
        assert_eq!(first_run, second_run);
        Ok(())
    }
}
