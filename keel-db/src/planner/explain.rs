//! Plan explanation: the node tree as a nested map, optionally with the
//! execution counters collected by a completed run.

use serde_json::{json, Map, Value as Json};

use crate::planner::nodes::*;
use crate::planner::Plan;

/// `{"explain": {...}}` for the plan. With `execute` set, per-node counters
/// are embedded (the plan must have been run first).
pub fn explain(plan: &Plan, execute: bool) -> Json {
    let (kind, node) = render_node(plan, plan.root, execute);
    let mut tree = Map::new();
    tree.insert(kind.to_string(), node);
    json!({ "explain": Json::Object(tree) })
}

fn render_node(plan: &Plan, id: NodeId, execute: bool) -> (&'static str, Json) {
    let node = &plan.nodes[id];
    let kind = node.kind_label();
    let mut attrs = Map::new();

    match node {
        PlanNode::SelectTop(node) => {
            embed_child(plan, &mut attrs, node.source, execute);
            if execute {
                attrs.insert("iterations".into(), json!(node.stats.iterations));
            }
        }
        PlanNode::Select(node) => {
            attrs.insert(
                "filter".into(),
                node.filter.as_ref().map(|f| f.to_json()).unwrap_or(Json::Null),
            );
            embed_child(plan, &mut attrs, node.source, execute);
            if execute {
                attrs.insert("iterations".into(), json!(node.stats.iterations));
            }
        }
        PlanNode::Scan(node) => {
            attrs.insert(
                "filter".into(),
                node.filter.as_ref().map(|f| f.to_json()).unwrap_or(Json::Null),
            );
            attrs.insert("collectionID".into(), json!(node.col.id.to_string()));
            attrs.insert("collectionName".into(), json!(node.col.name));
            let spans: Vec<Json> = if node.spans.is_empty() {
                vec![span_json(&Span::collection(node.col.id))]
            } else {
                node.spans.iter().map(span_json).collect()
            };
            attrs.insert("spans".into(), Json::Array(spans));
            if execute {
                attrs.insert("iterations".into(), json!(node.stats.iterations));
                attrs.insert("docFetches".into(), json!(node.stats.docs_fetched));
                attrs.insert("filterMatches".into(), json!(node.stats.docs_filtered));
            }
        }
        PlanNode::TypeJoin(node) => {
            attrs.insert(
                "joinType".into(),
                json!(match node.kind {
                    JoinKind::One => "typeJoinOne",
                    JoinKind::Many => "typeJoinMany",
                }),
            );
            attrs.insert(
                "direction".into(),
                json!(match node.direction {
                    JoinDirection::Primary => "primary",
                    JoinDirection::Secondary => "secondary",
                }),
            );
            attrs.insert("rootName".into(), json!(node.root_name));
            attrs.insert("subTypeName".into(), json!(node.sub_name));
            let (root_kind, root) = render_node(plan, node.root, execute);
            let mut wrapper = Map::new();
            wrapper.insert(root_kind.to_string(), root);
            attrs.insert("root".into(), Json::Object(wrapper));
            let (sub_kind, sub) = render_node(plan, node.sub, execute);
            let mut wrapper = Map::new();
            wrapper.insert(sub_kind.to_string(), sub);
            attrs.insert("subType".into(), Json::Object(wrapper));
            if execute {
                attrs.insert("iterations".into(), json!(node.stats.iterations));
            }
        }
        PlanNode::Group(node) => {
            attrs.insert("groupBy".into(), json!(node.by));
            embed_child(plan, &mut attrs, node.source, execute);
            if execute {
                attrs.insert("iterations".into(), json!(node.stats.iterations));
            }
        }
        PlanNode::Aggregate(node) => {
            attrs.insert(
                "sources".into(),
                json!([{
                    "fieldName": node.target_name,
                    "filter": node.filter.as_ref().map(|f| f.to_json()).unwrap_or(Json::Null),
                }]),
            );
            embed_child(plan, &mut attrs, node.source, execute);
            if execute {
                attrs.insert("iterations".into(), json!(node.stats.iterations));
            }
        }
        PlanNode::Order(node) => {
            let orderings: Vec<Json> = node
                .by
                .iter()
                .map(|(_, name, desc)| {
                    json!({
                        "fields": [name],
                        "direction": if *desc { "DESC" } else { "ASC" },
                    })
                })
                .collect();
            attrs.insert("orderings".into(), Json::Array(orderings));
            embed_child(plan, &mut attrs, node.source, execute);
            if execute {
                attrs.insert("iterations".into(), json!(node.stats.iterations));
            }
        }
        PlanNode::Limit(node) => {
            attrs.insert(
                "limit".into(),
                node.limit.map(|limit| json!(limit)).unwrap_or(Json::Null),
            );
            attrs.insert("offset".into(), json!(node.offset));
            embed_child(plan, &mut attrs, node.source, execute);
            if execute {
                attrs.insert("iterations".into(), json!(node.stats.iterations));
            }
        }
        PlanNode::DagScan(node) => {
            match &node.mode {
                DagScanMode::ByCid(cid) => {
                    attrs.insert("cid".into(), json!(cid));
                }
                _ => {
                    attrs.insert(
                        "dockey".into(),
                        node.dockey.as_ref().map(|key| json!(key)).unwrap_or(Json::Null),
                    );
                }
            }
            if execute {
                attrs.insert("iterations".into(), json!(node.stats.iterations));
            }
        }
        PlanNode::Parallel(node) => {
            embed_child(plan, &mut attrs, node.main, execute);
            if execute {
                attrs.insert("iterations".into(), json!(node.stats.iterations));
            }
        }
        PlanNode::Create(node) => {
            attrs.insert("data".into(), json!(node.data));
            embed_child(plan, &mut attrs, node.select, execute);
            if execute {
                attrs.insert("iterations".into(), json!(node.stats.iterations));
            }
        }
        PlanNode::Update(node) => {
            attrs.insert("data".into(), json!(node.data));
            attrs.insert(
                "ids".into(),
                node.targets.keys.as_ref().map(|keys| json!(keys)).unwrap_or(Json::Null),
            );
            attrs.insert(
                "filter".into(),
                node.targets
                    .filter
                    .as_ref()
                    .map(|f| f.to_json())
                    .unwrap_or(Json::Null),
            );
            embed_child(plan, &mut attrs, node.select, execute);
            if execute {
                attrs.insert("iterations".into(), json!(node.stats.iterations));
            }
        }
        PlanNode::Delete(node) => {
            attrs.insert(
                "ids".into(),
                node.targets.keys.as_ref().map(|keys| json!(keys)).unwrap_or(Json::Null),
            );
            attrs.insert(
                "filter".into(),
                node.targets
                    .filter
                    .as_ref()
                    .map(|f| f.to_json())
                    .unwrap_or(Json::Null),
            );
            embed_child(plan, &mut attrs, node.select, execute);
            if execute {
                attrs.insert("iterations".into(), json!(node.stats.iterations));
            }
        }
    }

    (kind, Json::Object(attrs))
}

fn embed_child(plan: &Plan, attrs: &mut Map<String, Json>, child: NodeId, execute: bool) {
    let (kind, node) = render_node(plan, child, execute);
    attrs.insert(kind.to_string(), node);
}

fn span_json(span: &Span) -> Json {
    serde_json::json!({ "start": span.start, "end": span.end })
}
