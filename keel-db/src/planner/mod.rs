//! Query planning: lowering the request AST into an executable node tree.
//!
//! Nodes are tagged variants in an arena addressed by stable indices, so a
//! join's sub-select can re-enter planning without ownership cycles; the
//! planner returns the root id. The execution chain inside one select is
//! (bottom up): scan, joins, parallel commit fan-out, select, group,
//! aggregates, order, limit, selectTop.

mod exec;
mod explain;
pub mod nodes;
mod render;

pub use exec::ExecEnv;
pub use nodes::{NodeId, PlanNode, Span};

use std::collections::BTreeMap;

use crate::error::{DbError, Result};
use crate::events::UpdateEvent;
use crate::mapper::DocumentMapping;
use crate::request::{
    ArgValue, ExplainType, Filter, OperationKind, Selection, ALL_COMMITS_QUERY, AVG_FIELD,
    COMMITS_QUERY, COUNT_FIELD, CREATE_PREFIX, DELETE_PREFIX, GROUP_FIELD, SUM_FIELD,
    UPDATE_PREFIX, VERSION_FIELD,
};
use crate::schema::{
    CollectionDescription, CrdtKind, FieldKind, RelationManager, RelationType, ID_SUFFIX,
    KEY_FIELD,
};
use nodes::*;

/// An executable plan for one top-level selection.
#[derive(Debug)]
pub struct Plan {
    pub(crate) nodes: Vec<PlanNode>,
    pub(crate) root: NodeId,
    pub(crate) mapping: DocumentMapping,
    /// Update events produced by mutation nodes during the run, published
    /// by the database after the batch is visible.
    pub(crate) events: Vec<UpdateEvent>,
    pub(crate) explain: Option<ExplainType>,
}

impl Plan {
    pub fn take_events(&mut self) -> Vec<UpdateEvent> {
        std::mem::take(&mut self.events)
    }
}

pub struct Planner<'a> {
    pub collections: &'a BTreeMap<String, CollectionDescription>,
    pub relations: &'a RelationManager,
}

struct PendingJoin {
    field_index: usize,
    sub_top: NodeId,
    kind: JoinKind,
    direction: JoinDirection,
    fk_index: usize,
    sub_fk_field: String,
    sub_col_id: u32,
    root_name: String,
    sub_name: String,
}

struct PendingAggregate {
    kind: AggregateKind,
    virtual_index: usize,
    target_name: String,
    inner_field: Option<String>,
    filter: Option<Filter>,
    limit: Option<u64>,
    offset: u64,
    /// For non-`_group` targets: the cell holding the aggregated sequence.
    target_index: Option<usize>,
}

impl<'a> Planner<'a> {
    pub fn new(
        collections: &'a BTreeMap<String, CollectionDescription>,
        relations: &'a RelationManager,
    ) -> Self {
        Self {
            collections,
            relations,
        }
    }

    /// Lower one top-level selection into a plan.
    pub fn plan(
        &self,
        selection: &Selection,
        kind: OperationKind,
        explain: Option<ExplainType>,
    ) -> Result<Plan> {
        let mut nodes = Vec::new();
        let (root, mapping) = if kind == OperationKind::Mutation {
            self.plan_mutation(&mut nodes, selection)?
        } else {
            match selection.name.as_str() {
                ALL_COMMITS_QUERY => {
                    self.plan_commits(&mut nodes, selection, DagScanMode::AllComposite)?
                }
                COMMITS_QUERY => {
                    let cid = selection
                        .argument("cid")
                        .and_then(ArgValue::as_str)
                        .ok_or_else(|| {
                            DbError::Unmarshal("commits requires a cid argument".to_string())
                        })?
                        .to_string();
                    self.plan_commits(&mut nodes, selection, DagScanMode::ByCid(cid))?
                }
                name => {
                    let col = self
                        .collections
                        .get(name)
                        .ok_or_else(|| DbError::CollectionUnknown(name.to_string()))?;
                    self.plan_select(&mut nodes, col, selection, &[])?
                }
            }
        };

        Ok(Plan {
            nodes,
            root,
            mapping,
            events: Vec::new(),
            explain,
        })
    }

    /// Plan a select over a collection: projection, joins, grouping,
    /// aggregates, ordering and pagination.
    fn plan_select(
        &self,
        nodes: &mut Vec<PlanNode>,
        col: &CollectionDescription,
        selection: &Selection,
        extra_hidden: &[String],
    ) -> Result<(NodeId, DocumentMapping)> {
        let mut mapping = DocumentMapping::new();
        mapping.add(KEY_FIELD, None, None);

        let filter = selection
            .argument("filter")
            .map(Filter::from_arg)
            .transpose()?;
        let limit = selection.argument("limit").and_then(ArgValue::as_u64);
        let offset = selection
            .argument("offset")
            .and_then(ArgValue::as_u64)
            .unwrap_or(0);
        let group_by: Option<Vec<String>> = selection
            .argument("groupBy")
            .map(|arg| match arg {
                ArgValue::List(items) => items
                    .iter()
                    .map(|item| match item {
                        ArgValue::Enum(name) => Ok(name.clone()),
                        ArgValue::Scalar(crate::value::Value::String(name)) => Ok(name.clone()),
                        _ => Err(DbError::Unmarshal("groupBy expects field names".to_string())),
                    })
                    .collect::<Result<Vec<_>>>(),
                ArgValue::Enum(name) => Ok(vec![name.clone()]),
                _ => Err(DbError::Unmarshal("groupBy expects a list".to_string())),
            })
            .transpose()?;
        let order = self.parse_order(selection)?;

        let mut joins: Vec<PendingJoin> = Vec::new();
        let mut aggregates: Vec<PendingAggregate> = Vec::new();
        let mut version_cells: Vec<(usize, NodeId)> = Vec::new();
        let mut group_child: Option<(usize, Selection)> = None;

        for child in &selection.children {
            let render = child.render_name().to_string();
            match child.name.as_str() {
                KEY_FIELD => {
                    mapping.set_render(0, render);
                }
                VERSION_FIELD => {
                    let child_mapping = commit_mapping(&child.children)?;
                    let scan = push(
                        nodes,
                        PlanNode::DagScan(DagScanNode {
                            mode: DagScanMode::HeadsOnly,
                            dockey: None,
                            mapping: child_mapping.clone(),
                            queue: None,
                            current: None,
                            stats: NodeStats::default(),
                        }),
                    );
                    let index = mapping.add(VERSION_FIELD, Some(render), Some(child_mapping));
                    version_cells.push((index, scan));
                }
                GROUP_FIELD => {
                    if group_by.is_none() {
                        return Err(DbError::FieldUnknown(GROUP_FIELD.to_string()));
                    }
                    // Child config resolved after the mapping is complete.
                    let index = mapping.add(GROUP_FIELD, Some(render), None);
                    group_child = Some((index, child.clone()));
                }
                COUNT_FIELD | SUM_FIELD | AVG_FIELD => {
                    let kind = match child.name.as_str() {
                        COUNT_FIELD => AggregateKind::Count,
                        SUM_FIELD => AggregateKind::Sum,
                        _ => AggregateKind::Average,
                    };
                    let pending =
                        self.plan_aggregate(nodes, col, child, kind, &mut mapping, &mut joins)?;
                    aggregates.push(pending);
                }
                name => {
                    let field = col
                        .field(name)
                        .ok_or_else(|| DbError::FieldUnknown(name.to_string()))?
                        .clone();
                    if field.kind.is_object() {
                        let join = self.plan_join(
                            nodes,
                            col,
                            &field,
                            child,
                            &mut mapping,
                            &[],
                            Some(render),
                        )?;
                        joins.push(join);
                    } else {
                        let index = mapping.ensure(name);
                        mapping.set_render(index, render);
                    }
                }
            }
        }

        // Fields referenced by filter, grouping or ordering ride along as
        // hidden cells.
        if let Some(filter) = &filter {
            let mut referenced = Vec::new();
            filter.fields(&mut referenced);
            for name in referenced {
                if col.field(&name).is_none() {
                    return Err(DbError::FieldUnknown(name));
                }
                mapping.ensure(&name);
            }
        }
        if let Some(group_by) = &group_by {
            for name in group_by {
                if col.field(name).is_none() {
                    return Err(DbError::FieldUnknown(name.clone()));
                }
                mapping.ensure(name);
            }
        }
        for (name, _) in &order {
            if col.field(name).is_none() {
                return Err(DbError::FieldUnknown(name.clone()));
            }
            mapping.ensure(name);
        }
        for name in extra_hidden {
            mapping.ensure(name);
        }

        // Resolve the `_group` child projection now that every parent field
        // it references can be ensured.
        let group_cfg = match group_child {
            Some((group_index, child)) => {
                let cfg = self.plan_group_child(col, &child, group_index, &mut mapping)?;
                mapping.set_child(group_index, cfg.child_mapping.clone());
                Some(cfg)
            }
            None => None,
        };

        // Aggregates over `_group` receive the full member list in their own
        // hidden cell.
        let mut agg_indices = Vec::new();
        for (position, pending) in aggregates.iter().enumerate() {
            if pending.target_index.is_none() {
                let index = mapping.add(format!("_agg{position}"), None, None);
                agg_indices.push(index);
            }
        }

        // Spans: a dockey argument or a primary-key filter pins the scan.
        let mut spans = Vec::new();
        if let Some(dockey) = selection.argument("dockey").and_then(ArgValue::as_str) {
            spans.push(Span::doc(col.id, dockey));
        }
        if let Some(dockeys) = selection.argument("dockeys").and_then(|a| a.as_string_list()) {
            for dockey in dockeys {
                spans.push(Span::doc(col.id, &dockey));
            }
        }
        if let Some(filter) = &filter {
            if let Some(dockey) = filter.key_lookup() {
                spans.push(Span::doc(col.id, &dockey));
            }
        }

        let fetch_fields = mapping
            .fields()
            .iter()
            .filter_map(|mapped| {
                col.field(&mapped.name)
                    .filter(|field| field.crdt == CrdtKind::LwwRegister)
                    .map(|field| (mapped.index, field.clone()))
            })
            .collect();

        let scan = push(
            nodes,
            PlanNode::Scan(ScanNode {
                col: col.clone(),
                mapping: mapping.clone(),
                fetch_fields,
                spans,
                filter: filter.clone(),
                join_filter: None,
                include_deleted: false,
                queue: None,
                current: None,
                stats: NodeStats::default(),
            }),
        );

        let mut current = scan;
        for join in joins {
            current = push(
                nodes,
                PlanNode::TypeJoin(TypeJoinNode {
                    root: current,
                    sub: join.sub_top,
                    kind: join.kind,
                    direction: join.direction,
                    field_index: join.field_index,
                    fk_index: join.fk_index,
                    sub_fk_field: join.sub_fk_field,
                    sub_col_id: join.sub_col_id,
                    root_name: join.root_name,
                    sub_name: join.sub_name,
                    current: None,
                    stats: NodeStats::default(),
                }),
            );
        }

        if !version_cells.is_empty() {
            current = push(
                nodes,
                PlanNode::Parallel(ParallelNode {
                    main: current,
                    children: version_cells,
                    current: None,
                    stats: NodeStats::default(),
                }),
            );
        }

        current = push(
            nodes,
            PlanNode::Select(SelectNode {
                source: current,
                filter: None,
                mapping: mapping.clone(),
                current: None,
                stats: NodeStats::default(),
            }),
        );

        if let Some(group_by) = &group_by {
            let by_indices = group_by
                .iter()
                .map(|name| mapping.index_of(name).expect("ensured above"))
                .collect();
            current = push(
                nodes,
                PlanNode::Group(GroupNode {
                    source: current,
                    by: group_by.clone(),
                    by_indices,
                    child: group_cfg,
                    agg_indices: agg_indices.clone(),
                    mapping: mapping.clone(),
                    buckets: None,
                    current: None,
                    stats: NodeStats::default(),
                }),
            );
        }

        let mut group_agg_cells = agg_indices.into_iter();
        for pending in aggregates {
            let (target_index, doc_mapping) = match pending.target_index {
                Some(index) => {
                    let child = mapping.field(index).child.clone();
                    (index, child.map(|boxed| *boxed).unwrap_or_default())
                }
                None => (
                    group_agg_cells.next().expect("cell reserved above"),
                    mapping.clone(),
                ),
            };
            let inner_index = pending
                .inner_field
                .as_ref()
                .map(|name| {
                    doc_mapping
                        .index_of(name)
                        .ok_or_else(|| DbError::FieldUnknown(name.clone()))
                })
                .transpose()?;
            current = push(
                nodes,
                PlanNode::Aggregate(AggregateNode {
                    source: current,
                    kind: pending.kind,
                    virtual_index: pending.virtual_index,
                    target_index,
                    target_name: pending.target_name,
                    inner_index,
                    filter: pending.filter,
                    doc_mapping,
                    limit: pending.limit,
                    offset: pending.offset,
                    current: None,
                    stats: NodeStats::default(),
                }),
            );
        }

        if !order.is_empty() {
            let by = order
                .iter()
                .map(|(name, desc)| {
                    (mapping.index_of(name).expect("ensured above"), name.clone(), *desc)
                })
                .collect();
            current = push(
                nodes,
                PlanNode::Order(OrderNode {
                    source: current,
                    by,
                    buffered: None,
                    current: None,
                    stats: NodeStats::default(),
                }),
            );
        }

        if limit.is_some() || offset > 0 {
            current = push(
                nodes,
                PlanNode::Limit(LimitNode {
                    source: current,
                    limit,
                    offset,
                    skipped: 0,
                    yielded: 0,
                    current: None,
                    stats: NodeStats::default(),
                }),
            );
        }

        let top = push(
            nodes,
            PlanNode::SelectTop(SelectTopNode {
                source: current,
                current: None,
                stats: NodeStats::default(),
            }),
        );
        Ok((top, mapping))
    }

    fn parse_order(&self, selection: &Selection) -> Result<Vec<(String, bool)>> {
        let Some(arg) = selection.argument("order") else {
            return Ok(Vec::new());
        };
        let ArgValue::Object(entries) = arg else {
            return Err(DbError::Unmarshal("order expects an object".to_string()));
        };
        entries
            .iter()
            .map(|(name, dir)| match dir {
                ArgValue::Enum(dir) if dir == "ASC" => Ok((name.clone(), false)),
                ArgValue::Enum(dir) if dir == "DESC" => Ok((name.clone(), true)),
                _ => Err(DbError::Unmarshal(format!(
                    "order for {name} must be ASC or DESC"
                ))),
            })
            .collect()
    }

    /// Expand a relation field into a typeIndexJoin, planning the child
    /// select. Direction derives from the primary side: the holder of the
    /// foreign key looks its counterpart up by span, the other side queries
    /// by fk filter.
    #[allow(clippy::too_many_arguments)]
    fn plan_join(
        &self,
        nodes: &mut Vec<PlanNode>,
        col: &CollectionDescription,
        field: &crate::schema::FieldDescription,
        child: &Selection,
        mapping: &mut DocumentMapping,
        extra_hidden: &[String],
        render: Option<String>,
    ) -> Result<PendingJoin> {
        if field.relation_type.contains(RelationType::MANYMANY) {
            return Err(DbError::InvalidRelation(format!(
                "{}: many-to-many relations require an explicit join collection",
                field.name
            )));
        }

        let sub_name = field
            .schema
            .as_ref()
            .ok_or_else(|| DbError::InvalidRelation(field.name.clone()))?;
        let sub_col = self
            .collections
            .get(sub_name)
            .ok_or_else(|| DbError::CollectionUnknown(sub_name.clone()))?;

        let relation_name = field
            .relation_name
            .as_ref()
            .ok_or_else(|| DbError::InvalidRelation(field.name.clone()))?;
        let relation = self
            .relations
            .relation(relation_name)
            .ok_or_else(|| DbError::InvalidRelation(relation_name.clone()))?;
        let side = relation
            .side(&col.name, &field.name)
            .ok_or_else(|| DbError::InvalidRelation(relation_name.clone()))?;

        let kind = if field.kind == FieldKind::ForeignObjectArray {
            JoinKind::Many
        } else {
            JoinKind::One
        };

        let mut sub_hidden: Vec<String> = extra_hidden.to_vec();
        let (direction, fk_index, sub_fk_field) = if side.is_primary() {
            let fk_index = mapping.ensure(&format!("{}{ID_SUFFIX}", field.name));
            (JoinDirection::Primary, fk_index, String::new())
        } else {
            let other = relation
                .other_side(&col.name, &field.name)
                .ok_or_else(|| DbError::InvalidRelation(relation_name.clone()))?;
            let fk_field = format!("{}{ID_SUFFIX}", other.field_name);
            sub_hidden.push(fk_field.clone());
            (JoinDirection::Secondary, 0, fk_field)
        };

        let (sub_top, sub_mapping) = self.plan_select(nodes, sub_col, child, &sub_hidden)?;
        let field_index = mapping.add(field.name.clone(), render, Some(sub_mapping));

        Ok(PendingJoin {
            field_index,
            sub_top,
            kind,
            direction,
            fk_index,
            sub_fk_field,
            sub_col_id: sub_col.id,
            root_name: col.name.clone(),
            sub_name: field.name.clone(),
        })
    }

    /// Aggregates target either a relation array (through a dedicated
    /// hidden join, unaffected by the rendered child's pagination) or the
    /// `_group` member list.
    fn plan_aggregate(
        &self,
        nodes: &mut Vec<PlanNode>,
        col: &CollectionDescription,
        child: &Selection,
        kind: AggregateKind,
        mapping: &mut DocumentMapping,
        joins: &mut Vec<PendingJoin>,
    ) -> Result<PendingAggregate> {
        let (target_name, config) = child
            .arguments
            .first()
            .ok_or_else(|| DbError::Unmarshal(format!("{} requires a target", child.name)))?;

        let inner_field = config
            .field("field")
            .and_then(|value| match value {
                ArgValue::Enum(name) => Some(name.clone()),
                ArgValue::Scalar(crate::value::Value::String(name)) => Some(name.clone()),
                _ => None,
            });
        let filter = config.field("filter").map(Filter::from_arg).transpose()?;
        let limit = config.field("limit").and_then(ArgValue::as_u64);
        let offset = config
            .field("offset")
            .and_then(ArgValue::as_u64)
            .unwrap_or(0);

        let virtual_index = mapping.add(
            format!("{}:{target_name}", child.name),
            Some(child.render_name().to_string()),
            None,
        );

        let target_index = if target_name == GROUP_FIELD {
            None
        } else {
            let field = col
                .field(target_name)
                .ok_or_else(|| DbError::FieldUnknown(target_name.clone()))?
                .clone();
            if !field.kind.is_object() {
                // Scalar sequences aggregate over the materialized cell
                // itself (element filter and limit run over primitives);
                // counting a non-sequence yields zero. Either way the cell
                // just has to be fetched.
                Some(mapping.ensure(target_name))
            } else {
                // A dedicated hidden join carries the aggregate's inputs,
                // unaffected by any rendered selection of the same field.
                let mut hidden = Vec::new();
                if let Some(inner) = &inner_field {
                    hidden.push(inner.clone());
                }
                if let Some(filter) = &filter {
                    filter.fields(&mut hidden);
                }
                let synthetic = Selection {
                    name: field.name.clone(),
                    alias: None,
                    arguments: Vec::new(),
                    children: Vec::new(),
                };
                let join =
                    self.plan_join(nodes, col, &field, &synthetic, mapping, &hidden, None)?;
                let index = join.field_index;
                joins.push(join);
                Some(index)
            }
        };

        Ok(PendingAggregate {
            kind,
            virtual_index,
            target_name: target_name.clone(),
            inner_field,
            filter,
            limit,
            offset,
            target_index,
        })
    }

    fn plan_group_child(
        &self,
        col: &CollectionDescription,
        child: &Selection,
        group_index: usize,
        mapping: &mut DocumentMapping,
    ) -> Result<GroupChildCfg> {
        let dockeys = child
            .argument("dockeys")
            .and_then(|arg| arg.as_string_list());
        let filter = child
            .argument("filter")
            .map(Filter::from_arg)
            .transpose()?;
        let limit = child.argument("limit").and_then(ArgValue::as_u64);
        let offset = child
            .argument("offset")
            .and_then(ArgValue::as_u64)
            .unwrap_or(0);

        let mut child_mapping = DocumentMapping::new();
        let mut projections = Vec::new();
        for grandchild in &child.children {
            let name = grandchild.name.as_str();
            if name != KEY_FIELD {
                let field = col
                    .field(name)
                    .ok_or_else(|| DbError::FieldUnknown(name.to_string()))?;
                if field.kind.is_object() {
                    return Err(DbError::FieldUnknown(name.to_string()));
                }
            }
            let parent_index = mapping.ensure(name);
            let child_index = child_mapping.add(
                name,
                Some(grandchild.render_name().to_string()),
                None,
            );
            projections.push((child_index, parent_index));
        }

        // Filter fields resolve against the parent row shape.
        if let Some(filter) = &filter {
            let mut referenced = Vec::new();
            filter.fields(&mut referenced);
            for name in referenced {
                if col.field(&name).is_none() {
                    return Err(DbError::FieldUnknown(name));
                }
                mapping.ensure(&name);
            }
        }

        Ok(GroupChildCfg {
            group_index,
            dockeys,
            filter,
            limit,
            offset,
            child_mapping,
            projections,
        })
    }

    fn plan_commits(
        &self,
        nodes: &mut Vec<PlanNode>,
        selection: &Selection,
        mode: DagScanMode,
    ) -> Result<(NodeId, DocumentMapping)> {
        let dockey = match &mode {
            DagScanMode::AllComposite => Some(
                selection
                    .argument("dockey")
                    .and_then(ArgValue::as_str)
                    .ok_or_else(|| {
                        DbError::Unmarshal("allCommits requires a dockey argument".to_string())
                    })?
                    .to_string(),
            ),
            _ => None,
        };

        let mapping = commit_mapping(&selection.children)?;
        let scan = push(
            nodes,
            PlanNode::DagScan(DagScanNode {
                mode,
                dockey,
                mapping: mapping.clone(),
                queue: None,
                current: None,
                stats: NodeStats::default(),
            }),
        );
        let top = push(
            nodes,
            PlanNode::SelectTop(SelectTopNode {
                source: scan,
                current: None,
                stats: NodeStats::default(),
            }),
        );
        Ok((top, mapping))
    }

    fn plan_mutation(
        &self,
        nodes: &mut Vec<PlanNode>,
        selection: &Selection,
    ) -> Result<(NodeId, DocumentMapping)> {
        let (verb, col_name) = if let Some(rest) = selection.name.strip_prefix(CREATE_PREFIX) {
            ("create", rest)
        } else if let Some(rest) = selection.name.strip_prefix(UPDATE_PREFIX) {
            ("update", rest)
        } else if let Some(rest) = selection.name.strip_prefix(DELETE_PREFIX) {
            ("delete", rest)
        } else {
            return Err(DbError::FieldUnknown(selection.name.clone()));
        };

        let col = self
            .collections
            .get(col_name)
            .ok_or_else(|| DbError::CollectionUnknown(col_name.to_string()))?;

        // Render selection: the mutation's children over the collection,
        // with spans injected at run time.
        let render_selection = Selection {
            name: col.name.clone(),
            alias: selection.alias.clone(),
            arguments: Vec::new(),
            children: selection.children.clone(),
        };
        let (select, mapping) = self.plan_select(nodes, col, &render_selection, &[])?;

        let node = match verb {
            "create" => {
                let data = selection
                    .argument("data")
                    .and_then(ArgValue::as_str)
                    .ok_or_else(|| {
                        DbError::Unmarshal("create mutation requires a data argument".to_string())
                    })?
                    .to_string();
                PlanNode::Create(CreateNode {
                    col: col.clone(),
                    data,
                    select,
                    done: false,
                    current: None,
                    stats: NodeStats::default(),
                })
            }
            "update" => {
                let data = selection
                    .argument("data")
                    .and_then(ArgValue::as_str)
                    .ok_or_else(|| {
                        DbError::Unmarshal("update mutation requires a data argument".to_string())
                    })?
                    .to_string();
                PlanNode::Update(UpdateNode {
                    col: col.clone(),
                    data,
                    targets: self.parse_targets(col, selection)?,
                    select,
                    done: false,
                    current: None,
                    stats: NodeStats::default(),
                })
            }
            _ => {
                mark_include_deleted(nodes, select);
                PlanNode::Delete(DeleteNode {
                    col: col.clone(),
                    targets: self.parse_targets(col, selection)?,
                    select,
                    done: false,
                    current: None,
                    stats: NodeStats::default(),
                })
            }
        };

        let root = push(nodes, node);
        Ok((root, mapping))
    }

    fn parse_targets(
        &self,
        col: &CollectionDescription,
        selection: &Selection,
    ) -> Result<MutationTargets> {
        let mut keys = None;
        if let Some(key) = selection
            .argument("id")
            .or_else(|| selection.argument("dockey"))
            .and_then(ArgValue::as_str)
        {
            keys = Some(vec![key.to_string()]);
        }
        if let Some(list) = selection
            .argument("ids")
            .or_else(|| selection.argument("dockeys"))
            .and_then(|arg| arg.as_string_list())
        {
            keys = Some(list);
        }

        let filter = selection
            .argument("filter")
            .map(Filter::from_arg)
            .transpose()?;

        let mut filter_mapping = DocumentMapping::new();
        filter_mapping.add(KEY_FIELD, None, None);
        if let Some(filter) = &filter {
            let mut referenced = Vec::new();
            filter.fields(&mut referenced);
            for name in referenced {
                if col.field(&name).is_none() {
                    return Err(DbError::FieldUnknown(name));
                }
                filter_mapping.ensure(&name);
            }
        }

        Ok(MutationTargets {
            keys,
            filter,
            filter_mapping,
        })
    }
}

/// Row shape of commit selections (`_version`, `commits`, `allCommits`).
fn commit_mapping(children: &[Selection]) -> Result<DocumentMapping> {
    let mut mapping = DocumentMapping::new();
    for child in children {
        let render = child.render_name().to_string();
        match child.name.as_str() {
            "cid" | "height" | "delta" | "dockey" | "schemaVersionId" => {
                mapping.add(child.name.clone(), Some(render), None);
            }
            "links" => {
                let mut link_mapping = DocumentMapping::new();
                for link_child in &child.children {
                    match link_child.name.as_str() {
                        "cid" | "name" => {
                            link_mapping.add(
                                link_child.name.clone(),
                                Some(link_child.render_name().to_string()),
                                None,
                            );
                        }
                        other => return Err(DbError::FieldUnknown(other.to_string())),
                    }
                }
                mapping.add("links", Some(render), Some(link_mapping));
            }
            other => return Err(DbError::FieldUnknown(other.to_string())),
        }
    }
    Ok(mapping)
}

fn push(nodes: &mut Vec<PlanNode>, node: PlanNode) -> NodeId {
    nodes.push(node);
    nodes.len() - 1
}

/// Delete mutations render the just-tombstoned documents, so their select
/// chain must not skip deleted rows.
fn mark_include_deleted(nodes: &mut [PlanNode], mut id: NodeId) {
    loop {
        match &mut nodes[id] {
            PlanNode::SelectTop(node) => id = node.source,
            PlanNode::Select(node) => id = node.source,
            PlanNode::Limit(node) => id = node.source,
            PlanNode::Order(node) => id = node.source,
            PlanNode::Group(node) => id = node.source,
            PlanNode::Aggregate(node) => id = node.source,
            PlanNode::Parallel(node) => id = node.main,
            PlanNode::TypeJoin(node) => id = node.root,
            PlanNode::Scan(node) => {
                node.include_deleted = true;
                return;
            }
            _ => return,
        }
    }
}
