//! Plan node variants and their runtime state.
//!
//! Nodes live in an arena (`Vec<PlanNode>`) and reference each other by
//! [`NodeId`]; the tree shape is fixed at plan time, the embedded state
//! mutates during execution.

use keel_store::keys;

use crate::mapper::DocumentMapping;
use crate::request::Filter;
use crate::schema::CollectionDescription;
use crate::value::Doc;

pub type NodeId = usize;

/// Per-node execution counters, reported by `@explain(type: execute)`.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub iterations: u64,
    pub docs_fetched: u64,
    pub docs_filtered: u64,
}

/// A half-open dockey range `[start, end)` bounding a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub start: String,
    pub end: String,
    /// Set when the span pins a single document.
    pub dockey: Option<String>,
}

impl Span {
    pub fn collection(col_id: u32) -> Self {
        Span {
            start: format!("/{col_id}"),
            end: format!("/{}", col_id + 1),
            dockey: None,
        }
    }

    pub fn doc(col_id: u32, dockey: &str) -> Self {
        let start = format!("/{col_id}/{dockey}");
        let end = keys::prefix_end(start.as_bytes())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_else(|| format!("/{}", col_id + 1));
        Span {
            start,
            end,
            dockey: Some(dockey.to_string()),
        }
    }
}

#[derive(Debug)]
pub enum PlanNode {
    SelectTop(SelectTopNode),
    Select(SelectNode),
    Scan(ScanNode),
    TypeJoin(TypeJoinNode),
    Group(GroupNode),
    Aggregate(AggregateNode),
    Order(OrderNode),
    Limit(LimitNode),
    DagScan(DagScanNode),
    Parallel(ParallelNode),
    Create(CreateNode),
    Update(UpdateNode),
    Delete(DeleteNode),
}

#[derive(Debug)]
pub struct SelectTopNode {
    pub source: NodeId,
    pub current: Option<Doc>,
    pub stats: NodeStats,
}

#[derive(Debug)]
pub struct SelectNode {
    pub source: NodeId,
    /// Residual post-join filter; scans carry their own.
    pub filter: Option<Filter>,
    pub mapping: DocumentMapping,
    pub current: Option<Doc>,
    pub stats: NodeStats,
}

#[derive(Debug)]
pub struct ScanNode {
    pub col: CollectionDescription,
    pub mapping: DocumentMapping,
    /// Mapping index and field description of every stored field to fetch.
    pub fetch_fields: Vec<(usize, crate::schema::FieldDescription)>,
    pub spans: Vec<Span>,
    pub filter: Option<Filter>,
    /// Injected by a secondary-direction join per outer row.
    pub join_filter: Option<Filter>,
    /// Deleted documents are skipped unless set (delete-mutation render).
    pub include_deleted: bool,
    pub queue: Option<std::vec::IntoIter<String>>,
    pub current: Option<Doc>,
    pub stats: NodeStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    One,
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDirection {
    /// This side stores the foreign key: look the child up by span.
    Primary,
    /// The child stores the foreign key: query it by fk filter.
    Secondary,
}

#[derive(Debug)]
pub struct TypeJoinNode {
    pub root: NodeId,
    pub sub: NodeId,
    pub kind: JoinKind,
    pub direction: JoinDirection,
    /// Cell the joined value lands in.
    pub field_index: usize,
    /// Cell holding the foreign key on the root row (primary direction).
    pub fk_index: usize,
    /// Foreign-key field name on the child collection (secondary direction).
    pub sub_fk_field: String,
    pub sub_col_id: u32,
    pub root_name: String,
    pub sub_name: String,
    pub current: Option<Doc>,
    pub stats: NodeStats,
}

/// Configuration of the `_group` projection inside a grouped select.
#[derive(Debug)]
pub struct GroupChildCfg {
    pub group_index: usize,
    /// Allow-list: only members with these dockeys surface in `_group`.
    pub dockeys: Option<Vec<String>>,
    pub filter: Option<Filter>,
    pub limit: Option<u64>,
    pub offset: u64,
    pub child_mapping: DocumentMapping,
    /// `(child index, parent index)` cell pairs for the projection.
    pub projections: Vec<(usize, usize)>,
}

#[derive(Debug)]
pub struct GroupNode {
    pub source: NodeId,
    pub by: Vec<String>,
    pub by_indices: Vec<usize>,
    pub child: Option<GroupChildCfg>,
    /// Cells that receive the full member list for aggregate targets.
    pub agg_indices: Vec<usize>,
    pub mapping: DocumentMapping,
    pub buckets: Option<std::vec::IntoIter<Doc>>,
    pub current: Option<Doc>,
    pub stats: NodeStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    Sum,
    Average,
}

#[derive(Debug)]
pub struct AggregateNode {
    pub source: NodeId,
    pub kind: AggregateKind,
    /// Cell the aggregate result is written into.
    pub virtual_index: usize,
    /// Cell holding the sequence being aggregated.
    pub target_index: usize,
    pub target_name: String,
    /// Cell (within the target docs) summed or averaged.
    pub inner_index: Option<usize>,
    pub filter: Option<Filter>,
    /// Mapping the target docs conform to.
    pub doc_mapping: DocumentMapping,
    pub limit: Option<u64>,
    pub offset: u64,
    pub current: Option<Doc>,
    pub stats: NodeStats,
}

#[derive(Debug)]
pub struct OrderNode {
    pub source: NodeId,
    /// `(cell index, field name, descending)` per ordering key.
    pub by: Vec<(usize, String, bool)>,
    pub buffered: Option<std::vec::IntoIter<Doc>>,
    pub current: Option<Doc>,
    pub stats: NodeStats,
}

#[derive(Debug)]
pub struct LimitNode {
    pub source: NodeId,
    pub limit: Option<u64>,
    pub offset: u64,
    pub skipped: u64,
    pub yielded: u64,
    pub current: Option<Doc>,
    pub stats: NodeStats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DagScanMode {
    /// `allCommits(dockey:)` — the full composite chain.
    AllComposite,
    /// `_version` — current composite heads only.
    HeadsOnly,
    /// `commits(cid:)` — a single commit, possibly empty.
    ByCid(String),
}

#[derive(Debug)]
pub struct DagScanNode {
    pub mode: DagScanMode,
    pub dockey: Option<String>,
    pub mapping: DocumentMapping,
    pub queue: Option<std::vec::IntoIter<Doc>>,
    pub current: Option<Doc>,
    pub stats: NodeStats,
}

/// Fans one input row out to commit-scan children re-joined on the row's
/// document key.
#[derive(Debug)]
pub struct ParallelNode {
    pub main: NodeId,
    /// `(cell index, dag-scan node)` pairs.
    pub children: Vec<(usize, NodeId)>,
    pub current: Option<Doc>,
    pub stats: NodeStats,
}

/// Target resolution for update/delete mutations.
#[derive(Debug)]
pub struct MutationTargets {
    pub keys: Option<Vec<String>>,
    pub filter: Option<Filter>,
    pub filter_mapping: DocumentMapping,
}

#[derive(Debug)]
pub struct CreateNode {
    pub col: CollectionDescription,
    pub data: String,
    pub select: NodeId,
    pub done: bool,
    pub current: Option<Doc>,
    pub stats: NodeStats,
}

#[derive(Debug)]
pub struct UpdateNode {
    pub col: CollectionDescription,
    pub data: String,
    pub targets: MutationTargets,
    pub select: NodeId,
    pub done: bool,
    pub current: Option<Doc>,
    pub stats: NodeStats,
}

#[derive(Debug)]
pub struct DeleteNode {
    pub col: CollectionDescription,
    pub targets: MutationTargets,
    pub select: NodeId,
    pub done: bool,
    pub current: Option<Doc>,
    pub stats: NodeStats,
}

impl PlanNode {
    /// Node kind label used by explain output.
    pub fn kind_label(&self) -> &'static str {
        match self {
            PlanNode::SelectTop(_) => "selectTopNode",
            PlanNode::Select(_) => "selectNode",
            PlanNode::Scan(_) => "scanNode",
            PlanNode::TypeJoin(_) => "typeIndexJoin",
            PlanNode::Group(_) => "groupNode",
            PlanNode::Aggregate(node) => match node.kind {
                AggregateKind::Count => "countNode",
                AggregateKind::Sum => "sumNode",
                AggregateKind::Average => "averageNode",
            },
            PlanNode::Order(_) => "orderNode",
            PlanNode::Limit(_) => "limitNode",
            PlanNode::DagScan(_) => "dagScanNode",
            PlanNode::Parallel(_) => "parallelNode",
            PlanNode::Create(_) => "createNode",
            PlanNode::Update(_) => "updateNode",
            PlanNode::Delete(_) => "deleteNode",
        }
    }
}
