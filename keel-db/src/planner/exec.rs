//! Pull-based plan execution.
//!
//! Every node implements the same contract: `start` prepares iterator state,
//! `next` advances and reports whether a row is available, the row itself is
//! taken out of the node's `current` slot. Parents drive children through the
//! arena by id; joins re-scope and restart their sub-plan once per outer row.

use std::collections::BTreeMap;
use std::time::Instant;

use cid::Cid;
use serde_json::Value as Json;

use keel_crdt::{Commit, DocStatus};

use crate::collection::StoreCtx;
use crate::error::{DbError, Result};
use crate::events::UpdateEvent;
use crate::mapper::DocumentMapping;
use crate::planner::nodes::*;
use crate::planner::{render, Plan};
use crate::request::{ExplainType, Filter, FilterOp};
use crate::schema::{CollectionDescription, CrdtKind, FieldDescription, ID_SUFFIX};
use crate::value::{total_cmp_values, Doc, Value};

/// Everything execution needs besides the plan itself.
pub struct ExecEnv<'a> {
    pub ctx: &'a StoreCtx,
    pub collections: &'a BTreeMap<String, CollectionDescription>,
    pub deadline: Option<Instant>,
    pub strict_relations: bool,
}

impl<'a> ExecEnv<'a> {
    fn check_deadline(&self) -> Result<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(DbError::CanceledOrTimeout);
            }
        }
        Ok(())
    }
}

impl Plan {
    /// Execute to exhaustion, rendering each row through the top mapping.
    pub fn run(&mut self, env: &ExecEnv<'_>) -> Result<Vec<Json>> {
        if self.explain == Some(ExplainType::Simple) {
            return Ok(vec![crate::planner::explain::explain(self, false)]);
        }

        let root = self.root;
        self.start(root, env)?;
        let mut rows = Vec::new();
        while self.next(root, env)? {
            let doc = self.take_value(root);
            rows.push(render::render_doc(&doc, &self.mapping));
        }
        self.close(root);

        if self.explain == Some(ExplainType::Execute) {
            return Ok(vec![crate::planner::explain::explain(self, true)]);
        }
        Ok(rows)
    }

    /// Scope the plan's scan to the given spans (subscription delivery and
    /// mutation render paths).
    pub fn set_spans(&mut self, spans: Vec<Span>) {
        let root = self.root;
        self.set_spans_on(root, spans);
    }

    pub(crate) fn start(&mut self, id: NodeId, env: &ExecEnv<'_>) -> Result<()> {
        match &mut self.nodes[id] {
            PlanNode::SelectTop(node) => {
                let source = node.source;
                self.start(source, env)
            }
            PlanNode::Select(node) => {
                let source = node.source;
                self.start(source, env)
            }
            PlanNode::Limit(node) => {
                let source = node.source;
                self.start(source, env)
            }
            PlanNode::Order(node) => {
                let source = node.source;
                self.start(source, env)
            }
            PlanNode::Group(node) => {
                let source = node.source;
                self.start(source, env)
            }
            PlanNode::Aggregate(node) => {
                let source = node.source;
                self.start(source, env)
            }
            // Join and parallel children start lazily, re-scoped per outer
            // row.
            PlanNode::TypeJoin(node) => {
                let root = node.root;
                self.start(root, env)
            }
            PlanNode::Parallel(node) => {
                let main = node.main;
                self.start(main, env)
            }
            PlanNode::Scan(node) => {
                if node.queue.is_none() {
                    let dockeys = resolve_scan_keys(env, &node.col, &node.spans)?;
                    node.queue = Some(dockeys.into_iter());
                }
                Ok(())
            }
            PlanNode::DagScan(node) => {
                if node.queue.is_none() {
                    let docs = dag_scan_rows(env, &node.mode, node.dockey.as_deref(), &node.mapping)?;
                    node.queue = Some(docs.into_iter());
                }
                Ok(())
            }
            // Mutations start their render select after the write runs.
            PlanNode::Create(_) | PlanNode::Update(_) | PlanNode::Delete(_) => Ok(()),
        }
    }

    pub(crate) fn next(&mut self, id: NodeId, env: &ExecEnv<'_>) -> Result<bool> {
        env.check_deadline()?;
        match &self.nodes[id] {
            PlanNode::SelectTop(_) | PlanNode::Limit(_) => self.next_forwarding(id, env),
            PlanNode::Select(_) => self.next_select(id, env),
            PlanNode::Scan(_) => self.next_scan(id, env),
            PlanNode::TypeJoin(_) => self.next_join(id, env),
            PlanNode::Group(_) => self.next_group(id, env),
            PlanNode::Aggregate(_) => self.next_aggregate(id, env),
            PlanNode::Order(_) => self.next_order(id, env),
            PlanNode::DagScan(_) => self.next_dag_scan(id),
            PlanNode::Parallel(_) => self.next_parallel(id, env),
            PlanNode::Create(_) => self.next_create(id, env),
            PlanNode::Update(_) => self.next_update(id, env),
            PlanNode::Delete(_) => self.next_delete(id, env),
        }
    }

    pub(crate) fn take_value(&mut self, id: NodeId) -> Doc {
        let slot = match &mut self.nodes[id] {
            PlanNode::SelectTop(node) => &mut node.current,
            PlanNode::Select(node) => &mut node.current,
            PlanNode::Scan(node) => &mut node.current,
            PlanNode::TypeJoin(node) => &mut node.current,
            PlanNode::Group(node) => &mut node.current,
            PlanNode::Aggregate(node) => &mut node.current,
            PlanNode::Order(node) => &mut node.current,
            PlanNode::Limit(node) => &mut node.current,
            PlanNode::DagScan(node) => &mut node.current,
            PlanNode::Parallel(node) => &mut node.current,
            PlanNode::Create(node) => &mut node.current,
            PlanNode::Update(node) => &mut node.current,
            PlanNode::Delete(node) => &mut node.current,
        };
        slot.take().unwrap_or_default()
    }

    fn store_value(&mut self, id: NodeId, doc: Doc) {
        match &mut self.nodes[id] {
            PlanNode::SelectTop(node) => {
                node.stats.iterations += 1;
                node.current = Some(doc);
            }
            PlanNode::Select(node) => {
                node.stats.iterations += 1;
                node.current = Some(doc);
            }
            PlanNode::TypeJoin(node) => {
                node.stats.iterations += 1;
                node.current = Some(doc);
            }
            PlanNode::Group(node) => {
                node.stats.iterations += 1;
                node.current = Some(doc);
            }
            PlanNode::Aggregate(node) => {
                node.stats.iterations += 1;
                node.current = Some(doc);
            }
            PlanNode::Order(node) => {
                node.stats.iterations += 1;
                node.current = Some(doc);
            }
            PlanNode::Limit(node) => {
                node.stats.iterations += 1;
                node.current = Some(doc);
            }
            PlanNode::Parallel(node) => {
                node.stats.iterations += 1;
                node.current = Some(doc);
            }
            PlanNode::Create(node) => {
                node.stats.iterations += 1;
                node.current = Some(doc);
            }
            PlanNode::Update(node) => {
                node.stats.iterations += 1;
                node.current = Some(doc);
            }
            PlanNode::Delete(node) => {
                node.stats.iterations += 1;
                node.current = Some(doc);
            }
            PlanNode::Scan(node) => {
                node.current = Some(doc);
            }
            PlanNode::DagScan(node) => {
                node.current = Some(doc);
            }
        }
    }

    fn next_forwarding(&mut self, id: NodeId, env: &ExecEnv<'_>) -> Result<bool> {
        // Limit applies offset/limit while forwarding; selectTop is a pure
        // pass-through.
        if let PlanNode::Limit(node) = &self.nodes[id] {
            let source = node.source;
            let offset = node.offset;
            let limit = node.limit;
            loop {
                let (skipped, yielded) = match &self.nodes[id] {
                    PlanNode::Limit(node) => (node.skipped, node.yielded),
                    _ => unreachable!(),
                };
                if let Some(limit) = limit {
                    if yielded >= limit {
                        return Ok(false);
                    }
                }
                if !self.next(source, env)? {
                    return Ok(false);
                }
                let doc = self.take_value(source);
                if skipped < offset {
                    if let PlanNode::Limit(node) = &mut self.nodes[id] {
                        node.skipped += 1;
                    }
                    continue;
                }
                if let PlanNode::Limit(node) = &mut self.nodes[id] {
                    node.yielded += 1;
                }
                self.store_value(id, doc);
                return Ok(true);
            }
        }

        let source = match &self.nodes[id] {
            PlanNode::SelectTop(node) => node.source,
            _ => unreachable!(),
        };
        if !self.next(source, env)? {
            return Ok(false);
        }
        let doc = self.take_value(source);
        self.store_value(id, doc);
        Ok(true)
    }

    fn next_select(&mut self, id: NodeId, env: &ExecEnv<'_>) -> Result<bool> {
        let source = match &self.nodes[id] {
            PlanNode::Select(node) => node.source,
            _ => unreachable!(),
        };
        loop {
            if !self.next(source, env)? {
                return Ok(false);
            }
            let doc = self.take_value(source);
            let keep = match &self.nodes[id] {
                PlanNode::Select(node) => match &node.filter {
                    Some(filter) => filter.matches(&doc, &node.mapping)?,
                    None => true,
                },
                _ => unreachable!(),
            };
            if keep {
                self.store_value(id, doc);
                return Ok(true);
            }
        }
    }

    fn next_scan(&mut self, id: NodeId, env: &ExecEnv<'_>) -> Result<bool> {
        loop {
            let node = match &mut self.nodes[id] {
                PlanNode::Scan(node) => node,
                _ => unreachable!(),
            };
            node.stats.iterations += 1;
            let Some(dockey) = node.queue.as_mut().and_then(Iterator::next) else {
                node.current = None;
                return Ok(false);
            };

            match env.ctx.doc_status(&node.col, &dockey)? {
                None => continue,
                Some(DocStatus::Deleted) if !node.include_deleted => continue,
                Some(_) => {}
            }
            node.stats.docs_fetched += 1;

            let mut doc = node.mapping.new_doc();
            doc.fields[0] = Value::DocKey(dockey.clone());
            for (index, field) in &node.fetch_fields {
                doc.fields[*index] = env.ctx.fetch_field(&node.col, &dockey, field)?;
            }

            let mut keep = match &node.filter {
                Some(filter) => filter.matches(&doc, &node.mapping)?,
                None => true,
            };
            if keep {
                if let Some(filter) = &node.join_filter {
                    keep = filter.matches(&doc, &node.mapping)?;
                }
            }
            if !keep {
                node.stats.docs_filtered += 1;
                continue;
            }
            node.current = Some(doc);
            return Ok(true);
        }
    }

    fn next_join(&mut self, id: NodeId, env: &ExecEnv<'_>) -> Result<bool> {
        let (root, sub, kind, direction, field_index, fk_index, sub_fk_field, sub_col_id) =
            match &self.nodes[id] {
                PlanNode::TypeJoin(node) => (
                    node.root,
                    node.sub,
                    node.kind,
                    node.direction,
                    node.field_index,
                    node.fk_index,
                    node.sub_fk_field.clone(),
                    node.sub_col_id,
                ),
                _ => unreachable!(),
            };

        if !self.next(root, env)? {
            return Ok(false);
        }
        let mut doc = self.take_value(root);

        let matches = match direction {
            JoinDirection::Primary => {
                let fk = doc.fields[fk_index].clone();
                match fk.as_dockey() {
                    None => Vec::new(),
                    Some(key) => {
                        self.set_spans_on(sub, vec![Span::doc(sub_col_id, key)]);
                        self.reset(sub);
                        self.start(sub, env)?;
                        self.drain(sub, env)?
                    }
                }
            }
            JoinDirection::Secondary => {
                let root_key = doc.fields[0]
                    .as_dockey()
                    .unwrap_or_default()
                    .to_string();
                self.set_join_filter_on(
                    sub,
                    Some(Filter::Condition {
                        field: sub_fk_field,
                        op: FilterOp::Eq(Value::DocKey(root_key)),
                    }),
                );
                self.reset(sub);
                self.start(sub, env)?;
                self.drain(sub, env)?
            }
        };

        doc.fields[field_index] = match kind {
            JoinKind::Many => Value::Docs(matches),
            JoinKind::One => matches
                .into_iter()
                .next()
                .map(|child| Value::Doc(Box::new(child)))
                .unwrap_or(Value::Null),
        };
        self.store_value(id, doc);
        Ok(true)
    }

    fn next_group(&mut self, id: NodeId, env: &ExecEnv<'_>) -> Result<bool> {
        let source = match &self.nodes[id] {
            PlanNode::Group(node) => node.source,
            _ => unreachable!(),
        };
        let needs_fill = matches!(&self.nodes[id], PlanNode::Group(node) if node.buckets.is_none());
        if needs_fill {
            let mut members = Vec::new();
            while self.next(source, env)? {
                members.push(self.take_value(source));
            }
            let node = match &mut self.nodes[id] {
                PlanNode::Group(node) => node,
                _ => unreachable!(),
            };
            let rows = build_buckets(node, members)?;
            node.buckets = Some(rows.into_iter());
        }

        let node = match &mut self.nodes[id] {
            PlanNode::Group(node) => node,
            _ => unreachable!(),
        };
        node.stats.iterations += 1;
        match node.buckets.as_mut().and_then(Iterator::next) {
            Some(row) => {
                node.current = Some(row);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn next_aggregate(&mut self, id: NodeId, env: &ExecEnv<'_>) -> Result<bool> {
        let source = match &self.nodes[id] {
            PlanNode::Aggregate(node) => node.source,
            _ => unreachable!(),
        };
        if !self.next(source, env)? {
            return Ok(false);
        }
        let mut doc = self.take_value(source);

        let node = match &self.nodes[id] {
            PlanNode::Aggregate(node) => node,
            _ => unreachable!(),
        };
        let result = aggregate_cell(node, &doc)?;
        doc.fields[node.virtual_index] = result;
        self.store_value(id, doc);
        Ok(true)
    }

    fn next_order(&mut self, id: NodeId, env: &ExecEnv<'_>) -> Result<bool> {
        let source = match &self.nodes[id] {
            PlanNode::Order(node) => node.source,
            _ => unreachable!(),
        };
        let needs_fill = matches!(&self.nodes[id], PlanNode::Order(node) if node.buffered.is_none());
        if needs_fill {
            let mut rows = Vec::new();
            while self.next(source, env)? {
                rows.push(self.take_value(source));
            }
            let node = match &mut self.nodes[id] {
                PlanNode::Order(node) => node,
                _ => unreachable!(),
            };
            rows.sort_by(|a, b| {
                for (index, _, desc) in &node.by {
                    let ordering = total_cmp_values(&a.fields[*index], &b.fields[*index]);
                    let ordering = if *desc { ordering.reverse() } else { ordering };
                    if !ordering.is_eq() {
                        return ordering;
                    }
                }
                std::cmp::Ordering::Equal
            });
            node.buffered = Some(rows.into_iter());
        }

        let node = match &mut self.nodes[id] {
            PlanNode::Order(node) => node,
            _ => unreachable!(),
        };
        node.stats.iterations += 1;
        match node.buffered.as_mut().and_then(Iterator::next) {
            Some(row) => {
                node.current = Some(row);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn next_dag_scan(&mut self, id: NodeId) -> Result<bool> {
        let node = match &mut self.nodes[id] {
            PlanNode::DagScan(node) => node,
            _ => unreachable!(),
        };
        node.stats.iterations += 1;
        match node.queue.as_mut().and_then(Iterator::next) {
            Some(row) => {
                node.current = Some(row);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn next_parallel(&mut self, id: NodeId, env: &ExecEnv<'_>) -> Result<bool> {
        let (main, children) = match &self.nodes[id] {
            PlanNode::Parallel(node) => (node.main, node.children.clone()),
            _ => unreachable!(),
        };
        if !self.next(main, env)? {
            return Ok(false);
        }
        let mut doc = self.take_value(main);
        let dockey = doc.fields[0].as_dockey().unwrap_or_default().to_string();

        for (cell, child) in children {
            self.set_dag_dockey(child, &dockey);
            self.reset(child);
            self.start(child, env)?;
            let rows = self.drain(child, env)?;
            doc.fields[cell] = Value::Docs(rows);
        }
        self.store_value(id, doc);
        Ok(true)
    }

    fn next_create(&mut self, id: NodeId, env: &ExecEnv<'_>) -> Result<bool> {
        let (done, select) = match &self.nodes[id] {
            PlanNode::Create(node) => (node.done, node.select),
            _ => unreachable!(),
        };
        if !done {
            let (col, data) = match &self.nodes[id] {
                PlanNode::Create(node) => (node.col.clone(), node.data.clone()),
                _ => unreachable!(),
            };
            let values = parse_mutation_data(&col, &data, env)?;
            let (dockey, cid) = env.ctx.create_doc(&col, &values)?;
            self.events.push(UpdateEvent {
                collection: col.name.clone(),
                dockey: dockey.clone(),
                cid: cid.to_string(),
            });
            self.set_spans_on(select, vec![Span::doc(col.id, &dockey)]);
            self.reset(select);
            self.start(select, env)?;
            if let PlanNode::Create(node) = &mut self.nodes[id] {
                node.done = true;
            }
        }

        if !self.next(select, env)? {
            return Ok(false);
        }
        let doc = self.take_value(select);
        self.store_value(id, doc);
        Ok(true)
    }

    fn next_update(&mut self, id: NodeId, env: &ExecEnv<'_>) -> Result<bool> {
        let (done, select) = match &self.nodes[id] {
            PlanNode::Update(node) => (node.done, node.select),
            _ => unreachable!(),
        };
        if !done {
            let (col, data, keys, filter, filter_mapping) = match &self.nodes[id] {
                PlanNode::Update(node) => (
                    node.col.clone(),
                    node.data.clone(),
                    node.targets.keys.clone(),
                    node.targets.filter.clone(),
                    node.targets.filter_mapping.clone(),
                ),
                _ => unreachable!(),
            };
            let targets = resolve_targets(env, &col, keys, &filter, &filter_mapping, false)?;
            if let PlanNode::Update(node) = &mut self.nodes[id] {
                node.done = true;
            }
            if targets.is_empty() {
                return Ok(false);
            }
            let values = parse_mutation_data(&col, &data, env)?;
            let mut spans = Vec::new();
            for dockey in &targets {
                let cid = env.ctx.update_doc(&col, dockey, &values)?;
                self.events.push(UpdateEvent {
                    collection: col.name.clone(),
                    dockey: dockey.clone(),
                    cid: cid.to_string(),
                });
                spans.push(Span::doc(col.id, dockey));
            }
            self.set_spans_on(select, spans);
            self.reset(select);
            self.start(select, env)?;
        }

        if !self.next(select, env)? {
            return Ok(false);
        }
        let doc = self.take_value(select);
        self.store_value(id, doc);
        Ok(true)
    }

    fn next_delete(&mut self, id: NodeId, env: &ExecEnv<'_>) -> Result<bool> {
        let (done, select) = match &self.nodes[id] {
            PlanNode::Delete(node) => (node.done, node.select),
            _ => unreachable!(),
        };
        if !done {
            let (col, keys, filter, filter_mapping) = match &self.nodes[id] {
                PlanNode::Delete(node) => (
                    node.col.clone(),
                    node.targets.keys.clone(),
                    node.targets.filter.clone(),
                    node.targets.filter_mapping.clone(),
                ),
                _ => unreachable!(),
            };
            let targets = resolve_targets(env, &col, keys, &filter, &filter_mapping, false)?;
            if let PlanNode::Delete(node) = &mut self.nodes[id] {
                node.done = true;
            }
            if targets.is_empty() {
                return Ok(false);
            }
            let mut spans = Vec::new();
            for dockey in &targets {
                let cid = env.ctx.delete_doc(&col, dockey)?;
                self.events.push(UpdateEvent {
                    collection: col.name.clone(),
                    dockey: dockey.clone(),
                    cid: cid.to_string(),
                });
                spans.push(Span::doc(col.id, dockey));
            }
            self.set_spans_on(select, spans);
            self.reset(select);
            self.start(select, env)?;
        }

        if !self.next(select, env)? {
            return Ok(false);
        }
        let doc = self.take_value(select);
        self.store_value(id, doc);
        Ok(true)
    }

    fn drain(&mut self, id: NodeId, env: &ExecEnv<'_>) -> Result<Vec<Doc>> {
        let mut rows = Vec::new();
        while self.next(id, env)? {
            rows.push(self.take_value(id));
        }
        Ok(rows)
    }

    /// Clear iterator state so a node chain can run again (joins and
    /// mutation renders). Configured spans and filters survive.
    fn reset(&mut self, id: NodeId) {
        match &mut self.nodes[id] {
            PlanNode::SelectTop(node) => {
                node.current = None;
                let source = node.source;
                self.reset(source);
            }
            PlanNode::Select(node) => {
                node.current = None;
                let source = node.source;
                self.reset(source);
            }
            PlanNode::Limit(node) => {
                node.current = None;
                node.skipped = 0;
                node.yielded = 0;
                let source = node.source;
                self.reset(source);
            }
            PlanNode::Order(node) => {
                node.current = None;
                node.buffered = None;
                let source = node.source;
                self.reset(source);
            }
            PlanNode::Group(node) => {
                node.current = None;
                node.buckets = None;
                let source = node.source;
                self.reset(source);
            }
            PlanNode::Aggregate(node) => {
                node.current = None;
                let source = node.source;
                self.reset(source);
            }
            PlanNode::TypeJoin(node) => {
                node.current = None;
                let (root, sub) = (node.root, node.sub);
                self.reset(root);
                self.reset(sub);
            }
            PlanNode::Parallel(node) => {
                node.current = None;
                let main = node.main;
                let children: Vec<NodeId> =
                    node.children.iter().map(|(_, child)| *child).collect();
                self.reset(main);
                for child in children {
                    self.reset(child);
                }
            }
            PlanNode::Scan(node) => {
                node.current = None;
                node.queue = None;
            }
            PlanNode::DagScan(node) => {
                node.current = None;
                node.queue = None;
            }
            // Mutation nodes never re-run their write.
            PlanNode::Create(node) => {
                node.current = None;
            }
            PlanNode::Update(node) => {
                node.current = None;
            }
            PlanNode::Delete(node) => {
                node.current = None;
            }
        }
    }

    fn set_spans_on(&mut self, id: NodeId, spans: Vec<Span>) {
        match &mut self.nodes[id] {
            PlanNode::SelectTop(node) => {
                let source = node.source;
                self.set_spans_on(source, spans);
            }
            PlanNode::Select(node) => {
                let source = node.source;
                self.set_spans_on(source, spans);
            }
            PlanNode::Limit(node) => {
                let source = node.source;
                self.set_spans_on(source, spans);
            }
            PlanNode::Order(node) => {
                let source = node.source;
                self.set_spans_on(source, spans);
            }
            PlanNode::Group(node) => {
                let source = node.source;
                self.set_spans_on(source, spans);
            }
            PlanNode::Aggregate(node) => {
                let source = node.source;
                self.set_spans_on(source, spans);
            }
            PlanNode::TypeJoin(node) => {
                let root = node.root;
                self.set_spans_on(root, spans);
            }
            PlanNode::Parallel(node) => {
                let main = node.main;
                self.set_spans_on(main, spans);
            }
            PlanNode::Scan(node) => {
                node.spans = spans;
            }
            PlanNode::Create(node) => {
                let select = node.select;
                self.set_spans_on(select, spans);
            }
            PlanNode::Update(node) => {
                let select = node.select;
                self.set_spans_on(select, spans);
            }
            PlanNode::Delete(node) => {
                let select = node.select;
                self.set_spans_on(select, spans);
            }
            PlanNode::DagScan(_) => {}
        }
    }

    fn set_join_filter_on(&mut self, id: NodeId, filter: Option<Filter>) {
        match &mut self.nodes[id] {
            PlanNode::SelectTop(node) => {
                let source = node.source;
                self.set_join_filter_on(source, filter);
            }
            PlanNode::Select(node) => {
                let source = node.source;
                self.set_join_filter_on(source, filter);
            }
            PlanNode::Limit(node) => {
                let source = node.source;
                self.set_join_filter_on(source, filter);
            }
            PlanNode::Order(node) => {
                let source = node.source;
                self.set_join_filter_on(source, filter);
            }
            PlanNode::Group(node) => {
                let source = node.source;
                self.set_join_filter_on(source, filter);
            }
            PlanNode::Aggregate(node) => {
                let source = node.source;
                self.set_join_filter_on(source, filter);
            }
            PlanNode::TypeJoin(node) => {
                let root = node.root;
                self.set_join_filter_on(root, filter);
            }
            PlanNode::Parallel(node) => {
                let main = node.main;
                self.set_join_filter_on(main, filter);
            }
            PlanNode::Scan(node) => {
                node.join_filter = filter;
            }
            _ => {}
        }
    }

    fn set_dag_dockey(&mut self, id: NodeId, dockey: &str) {
        if let PlanNode::DagScan(node) = &mut self.nodes[id] {
            node.dockey = Some(dockey.to_string());
        }
    }

    pub(crate) fn close(&mut self, id: NodeId) {
        self.reset(id);
    }
}

fn resolve_scan_keys(
    env: &ExecEnv<'_>,
    col: &CollectionDescription,
    spans: &[Span],
) -> Result<Vec<String>> {
    if spans.is_empty() {
        return env.ctx.collection_dockeys(col);
    }
    let mut keys = Vec::new();
    for span in spans {
        match &span.dockey {
            Some(dockey) => keys.push(dockey.clone()),
            None => keys.extend(env.ctx.collection_dockeys(col)?),
        }
    }
    keys.sort();
    keys.dedup();
    Ok(keys)
}

/// Bucket rows by the group-by key tuple, first-seen order, and project each
/// bucket into its output row.
fn build_buckets(node: &mut GroupNode, members: Vec<Doc>) -> Result<Vec<Doc>> {
    let mut buckets: Vec<(Vec<Value>, Vec<Doc>)> = Vec::new();
    for member in members {
        let key: Vec<Value> = node
            .by_indices
            .iter()
            .map(|index| member.fields[*index].clone())
            .collect();
        match buckets.iter_mut().find(|(existing, _)| {
            existing.len() == key.len()
                && existing
                    .iter()
                    .zip(&key)
                    .all(|(a, b)| total_cmp_values(a, b).is_eq())
        }) {
            Some((_, docs)) => docs.push(member),
            None => buckets.push((key, vec![member])),
        }
    }

    let mut rows = Vec::new();
    for (key, members) in buckets {
        let mut row = node.mapping.new_doc();
        for (position, index) in node.by_indices.iter().enumerate() {
            row.fields[*index] = key[position].clone();
        }
        for agg_index in &node.agg_indices {
            row.fields[*agg_index] = Value::Docs(members.clone());
        }
        if let Some(cfg) = &node.child {
            row.fields[cfg.group_index] = Value::Docs(project_group(cfg, &members, &node.mapping)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn project_group(
    cfg: &GroupChildCfg,
    members: &[Doc],
    parent_mapping: &DocumentMapping,
) -> Result<Vec<Doc>> {
    let mut kept = Vec::new();
    for member in members {
        if let Some(allow) = &cfg.dockeys {
            let key = member.fields[0].as_dockey().unwrap_or_default();
            if !allow.iter().any(|candidate| candidate == key) {
                continue;
            }
        }
        if let Some(filter) = &cfg.filter {
            if !filter.matches(member, parent_mapping)? {
                continue;
            }
        }
        kept.push(member);
    }

    let limited = kept
        .into_iter()
        .skip(cfg.offset as usize)
        .take(cfg.limit.map(|limit| limit as usize).unwrap_or(usize::MAX));

    let mut rows = Vec::new();
    for member in limited {
        let mut row = cfg.child_mapping.new_doc();
        for (child_index, parent_index) in &cfg.projections {
            row.fields[*child_index] = member.fields[*parent_index].clone();
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Evaluate one aggregate over its target cell: a joined document set, a
/// scalar sequence, or (for anything else) the empty-sequence results.
/// Counting a non-sequence is zero; sum and average of an empty sequence
/// are `0` / `0.0`.
fn aggregate_cell(node: &AggregateNode, doc: &Doc) -> Result<Value> {
    match &doc.fields[node.target_index] {
        Value::Docs(docs) => aggregate_docs(node, docs),
        Value::List(items) => aggregate_scalars(node, items),
        _ => Ok(match node.kind {
            AggregateKind::Count => Value::Int(0),
            AggregateKind::Sum => Value::Int(0),
            AggregateKind::Average => Value::Float(0.0),
        }),
    }
}

fn aggregate_docs(node: &AggregateNode, docs: &[Doc]) -> Result<Value> {
    let mut selected: Vec<&Doc> = Vec::new();
    for candidate in docs {
        if candidate.hidden {
            continue;
        }
        if let Some(filter) = &node.filter {
            if !filter.matches(candidate, &node.doc_mapping)? {
                continue;
            }
        }
        selected.push(candidate);
    }
    let selected = selected
        .into_iter()
        .skip(node.offset as usize)
        .take(node.limit.map(|limit| limit as usize).unwrap_or(usize::MAX));

    match node.kind {
        AggregateKind::Count => Ok(Value::Int(selected.count() as i64)),
        AggregateKind::Sum | AggregateKind::Average => {
            let inner = node
                .inner_index
                .ok_or_else(|| DbError::Unmarshal("aggregate requires a field".to_string()))?;
            numeric_fold(node.kind, selected.map(|candidate| &candidate.fields[inner]))
        }
    }
}

/// The primitive counterpart of [`aggregate_docs`]: filter and limit run
/// directly over the sequence elements.
fn aggregate_scalars(node: &AggregateNode, items: &[Value]) -> Result<Value> {
    let mut selected: Vec<&Value> = Vec::new();
    for item in items {
        if let Some(filter) = &node.filter {
            if !filter.matches_value(item)? {
                continue;
            }
        }
        selected.push(item);
    }
    let selected = selected
        .into_iter()
        .skip(node.offset as usize)
        .take(node.limit.map(|limit| limit as usize).unwrap_or(usize::MAX));

    match node.kind {
        AggregateKind::Count => Ok(Value::Int(selected.count() as i64)),
        AggregateKind::Sum | AggregateKind::Average => numeric_fold(node.kind, selected),
    }
}

fn numeric_fold<'a>(
    kind: AggregateKind,
    values: impl Iterator<Item = &'a Value>,
) -> Result<Value> {
    let mut sum = 0.0;
    let mut all_int = true;
    let mut count = 0u64;
    for value in values {
        match value {
            Value::Int(value) => sum += *value as f64,
            Value::Float(value) => {
                sum += value;
                all_int = false;
            }
            _ => continue,
        }
        count += 1;
    }
    if kind == AggregateKind::Sum {
        if all_int {
            Ok(Value::Int(sum as i64))
        } else {
            Ok(Value::Float(sum))
        }
    } else if count == 0 {
        Ok(Value::Float(0.0))
    } else {
        Ok(Value::Float(sum / count as f64))
    }
}

/// Rows for a commit scan: the composite chain, the current heads, or a
/// single commit by CID (an undecodable CID yields an empty result).
fn dag_scan_rows(
    env: &ExecEnv<'_>,
    mode: &DagScanMode,
    dockey: Option<&str>,
    mapping: &DocumentMapping,
) -> Result<Vec<Doc>> {
    let commits: Vec<(Cid, Commit)> = match mode {
        DagScanMode::AllComposite => match dockey {
            Some(dockey) => env.ctx.dag.walk_composite(dockey)?,
            None => Vec::new(),
        },
        DagScanMode::HeadsOnly => match dockey {
            Some(dockey) => env.ctx.dag.head_commits(dockey)?,
            None => Vec::new(),
        },
        DagScanMode::ByCid(text) => match Cid::try_from(text.as_str()) {
            Ok(cid) => env
                .ctx
                .dag
                .get_commit(&cid)?
                .map(|commit| vec![(cid, commit)])
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        },
    };

    Ok(commits
        .iter()
        .map(|(cid, commit)| commit_doc(mapping, cid, commit))
        .collect())
}

fn commit_doc(mapping: &DocumentMapping, cid: &Cid, commit: &Commit) -> Doc {
    let mut doc = mapping.new_doc();
    for mapped in mapping.fields() {
        doc.fields[mapped.index] = match mapped.name.as_str() {
            "cid" => Value::String(cid.to_string()),
            "height" => Value::Int(commit.height as i64),
            "delta" => Value::String(hex::encode(&commit.delta)),
            "dockey" => Value::String(commit.dockey.clone()),
            "schemaVersionId" => Value::String(commit.schema_version_id.clone()),
            "links" => {
                let child = mapped
                    .child
                    .as_deref()
                    .cloned()
                    .unwrap_or_default();
                let links = commit
                    .links
                    .iter()
                    .map(|link| {
                        let mut row = child.new_doc();
                        for link_field in child.fields() {
                            row.fields[link_field.index] = match link_field.name.as_str() {
                                "cid" => Value::String(link.cid.to_string()),
                                "name" => Value::String(link.name.clone()),
                                _ => Value::Null,
                            };
                        }
                        row
                    })
                    .collect();
                Value::Docs(links)
            }
            _ => Value::Null,
        };
    }
    doc
}

/// Decode and validate a mutation's `data` JSON against the collection
/// schema. In strict mode foreign keys must name existing documents.
fn parse_mutation_data(
    col: &CollectionDescription,
    data: &str,
    env: &ExecEnv<'_>,
) -> Result<Vec<(FieldDescription, Value)>> {
    let json: Json =
        serde_json::from_str(data).map_err(|err| DbError::Unmarshal(err.to_string()))?;
    let Json::Object(entries) = json else {
        return Err(DbError::Unmarshal("mutation data must be an object".to_string()));
    };

    let mut values = Vec::new();
    for (name, json) in entries {
        let field = col
            .field(&name)
            .filter(|field| field.crdt == CrdtKind::LwwRegister)
            .ok_or_else(|| DbError::FieldUnknown(name.clone()))?
            .clone();
        let value = Value::from_json(&json, field.kind, &name)?;

        if field.is_internal_id() && env.strict_relations {
            if let Some(target_key) = value.as_dockey() {
                let object_field = name
                    .strip_suffix(ID_SUFFIX)
                    .and_then(|object_name| col.field(object_name));
                let target_col = object_field
                    .and_then(|field| field.schema.as_deref())
                    .and_then(|schema| env.collections.get(schema));
                if let Some(target_col) = target_col {
                    if env.ctx.doc_status(target_col, target_key)?.is_none() {
                        return Err(DbError::RelatedDocumentMissing(target_key.to_string()));
                    }
                }
            }
        }

        values.push((field, value));
    }
    Ok(values)
}

/// Document keys targeted by an update/delete: the explicit id list, or a
/// filtered scan of the collection.
fn resolve_targets(
    env: &ExecEnv<'_>,
    col: &CollectionDescription,
    keys: Option<Vec<String>>,
    filter: &Option<Filter>,
    filter_mapping: &DocumentMapping,
    include_deleted: bool,
) -> Result<Vec<String>> {
    let candidates = match keys {
        Some(keys) => keys,
        None => env.ctx.collection_dockeys(col)?,
    };

    let fetch: Vec<(usize, FieldDescription)> = filter_mapping
        .fields()
        .iter()
        .filter_map(|mapped| {
            col.field(&mapped.name)
                .filter(|field| field.crdt == CrdtKind::LwwRegister)
                .map(|field| (mapped.index, field.clone()))
        })
        .collect();

    let mut targets = Vec::new();
    for dockey in candidates {
        match env.ctx.doc_status(col, &dockey)? {
            None => continue,
            Some(DocStatus::Deleted) if !include_deleted => continue,
            Some(_) => {}
        }
        if let Some(filter) = filter {
            let mut doc = filter_mapping.new_doc();
            doc.fields[0] = Value::DocKey(dockey.clone());
            for (index, field) in &fetch {
                doc.fields[*index] = env.ctx.fetch_field(col, &dockey, field)?;
            }
            if !filter.matches(&doc, filter_mapping)? {
                continue;
            }
        }
        targets.push(dockey);
    }
    Ok(targets)
}
