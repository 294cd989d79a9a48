//! Filter grammar and evaluation.
//!
//! `{ FIELD: { OP: VALUE } }` with boolean composition through `_and`,
//! `_or`, and `_not`. Null semantics: `_le: null` and `_ge: null` match only
//! documents lacking the field or holding null; `_eq: null` is the explicit
//! test; ordering operators never match null.

use crate::error::{DbError, Result};
use crate::mapper::DocumentMapping;
use crate::request::ArgValue;
use crate::value::{cmp_values, values_equal, Doc, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Condition { field: String, op: FilterOp },
    /// A predicate on a bare value rather than a named field: the form
    /// aggregates use against scalar sequences (`{_gt: 2}`).
    Element(FilterOp),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(Value),
    Ne(Value),
    Lt(Value),
    Le(Value),
    Gt(Value),
    Ge(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Like(String),
    Nlike(String),
}

impl Filter {
    /// Parse the argument object form of a filter.
    pub fn from_arg(arg: &ArgValue) -> Result<Filter> {
        let ArgValue::Object(entries) = arg else {
            return Err(DbError::Unmarshal("filter must be an object".to_string()));
        };
        let mut clauses = Vec::new();
        for (name, value) in entries {
            match name.as_str() {
                "_and" => clauses.push(Filter::And(Self::clause_list(value)?)),
                "_or" => clauses.push(Filter::Or(Self::clause_list(value)?)),
                "_not" => clauses.push(Filter::Not(Box::new(Filter::from_arg(value)?))),
                op if is_operator(op) => clauses.push(Filter::Element(parse_op(op, value)?)),
                field => {
                    let ArgValue::Object(ops) = value else {
                        return Err(DbError::Unmarshal(format!(
                            "filter for field {field} must be an object"
                        )));
                    };
                    for (op_name, op_value) in ops {
                        clauses.push(Filter::Condition {
                            field: field.to_string(),
                            op: parse_op(op_name, op_value)?,
                        });
                    }
                }
            }
        }
        Ok(match clauses.len() {
            1 => clauses.into_iter().next().expect("len checked"),
            _ => Filter::And(clauses),
        })
    }

    fn clause_list(value: &ArgValue) -> Result<Vec<Filter>> {
        let ArgValue::List(items) = value else {
            return Err(DbError::Unmarshal(
                "_and/_or expect a list of clauses".to_string(),
            ));
        };
        items.iter().map(Filter::from_arg).collect()
    }

    /// Evaluate against a row, resolving field names through the mapping.
    pub fn matches(&self, doc: &Doc, mapping: &DocumentMapping) -> Result<bool> {
        match self {
            Filter::And(clauses) => {
                for clause in clauses {
                    if !clause.matches(doc, mapping)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Filter::Or(clauses) => {
                for clause in clauses {
                    if clause.matches(doc, mapping)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Filter::Not(clause) => Ok(!clause.matches(doc, mapping)?),
            Filter::Condition { field, op } => {
                let index = mapping
                    .index_of(field)
                    .ok_or_else(|| DbError::FieldUnknown(field.clone()))?;
                let value = doc.fields.get(index).unwrap_or(&Value::Null);
                Ok(op.matches(value))
            }
            Filter::Element(op) => {
                let (name, _) = op.to_json();
                Err(DbError::UnsupportedOperator(format!(
                    "{name} applies to sequence elements, not documents"
                )))
            }
        }
    }

    /// Evaluate against a bare scalar, the element of a filtered sequence.
    pub fn matches_value(&self, value: &Value) -> Result<bool> {
        match self {
            Filter::And(clauses) => {
                for clause in clauses {
                    if !clause.matches_value(value)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Filter::Or(clauses) => {
                for clause in clauses {
                    if clause.matches_value(value)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Filter::Not(clause) => Ok(!clause.matches_value(value)?),
            Filter::Element(op) => Ok(op.matches(value)),
            Filter::Condition { field, .. } => Err(DbError::FieldUnknown(field.clone())),
        }
    }

    /// Collect every field name the filter references.
    pub fn fields(&self, out: &mut Vec<String>) {
        match self {
            Filter::And(clauses) | Filter::Or(clauses) => {
                for clause in clauses {
                    clause.fields(out);
                }
            }
            Filter::Not(clause) => clause.fields(out),
            Filter::Condition { field, .. } => {
                if !out.contains(field) {
                    out.push(field.clone());
                }
            }
            Filter::Element(_) => {}
        }
    }

    /// Render back to the external object shape (explain output).
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Filter::And(clauses) => {
                json!({ "_and": clauses.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
            Filter::Or(clauses) => {
                json!({ "_or": clauses.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
            Filter::Not(clause) => json!({ "_not": clause.to_json() }),
            Filter::Condition { field, op } => {
                let (name, value) = op.to_json();
                let mut ops = serde_json::Map::new();
                ops.insert(name.to_string(), value);
                let mut map = serde_json::Map::new();
                map.insert(field.clone(), serde_json::Value::Object(ops));
                serde_json::Value::Object(map)
            }
            Filter::Element(op) => {
                let (name, value) = op.to_json();
                let mut map = serde_json::Map::new();
                map.insert(name.to_string(), value);
                serde_json::Value::Object(map)
            }
        }
    }

    /// If the filter is a plain `_key` equality, the dockey it pins.
    pub fn key_lookup(&self) -> Option<String> {
        match self {
            Filter::Condition { field, op } if field == crate::schema::KEY_FIELD => match op {
                FilterOp::Eq(value) => value.as_dockey().map(str::to_string),
                _ => None,
            },
            _ => None,
        }
    }
}

impl FilterOp {
    pub fn matches(&self, value: &Value) -> bool {
        use std::cmp::Ordering::*;
        match self {
            FilterOp::Eq(expected) => values_equal(value, expected),
            FilterOp::Ne(expected) => !values_equal(value, expected),
            FilterOp::Lt(bound) => {
                !bound.is_null() && cmp_values(value, bound) == Some(Less)
            }
            FilterOp::Gt(bound) => {
                !bound.is_null() && cmp_values(value, bound) == Some(Greater)
            }
            FilterOp::Le(bound) => {
                if bound.is_null() {
                    value.is_null()
                } else {
                    matches!(cmp_values(value, bound), Some(Less | Equal))
                }
            }
            FilterOp::Ge(bound) => {
                if bound.is_null() {
                    value.is_null()
                } else {
                    matches!(cmp_values(value, bound), Some(Greater | Equal))
                }
            }
            FilterOp::In(set) => set.iter().any(|candidate| values_equal(value, candidate)),
            FilterOp::Nin(set) => !set.iter().any(|candidate| values_equal(value, candidate)),
            FilterOp::Like(pattern) => match value {
                Value::String(text) => like_match(pattern, text),
                _ => false,
            },
            FilterOp::Nlike(pattern) => match value {
                Value::String(text) => !like_match(pattern, text),
                _ => false,
            },
        }
    }
}

impl FilterOp {
    fn to_json(&self) -> (&'static str, serde_json::Value) {
        let values_json = |values: &[Value]| {
            serde_json::Value::Array(values.iter().map(Value::to_json).collect())
        };
        match self {
            FilterOp::Eq(value) => ("_eq", value.to_json()),
            FilterOp::Ne(value) => ("_ne", value.to_json()),
            FilterOp::Lt(value) => ("_lt", value.to_json()),
            FilterOp::Le(value) => ("_le", value.to_json()),
            FilterOp::Gt(value) => ("_gt", value.to_json()),
            FilterOp::Ge(value) => ("_ge", value.to_json()),
            FilterOp::In(values) => ("_in", values_json(values)),
            FilterOp::Nin(values) => ("_nin", values_json(values)),
            FilterOp::Like(pattern) => ("_like", serde_json::Value::String(pattern.clone())),
            FilterOp::Nlike(pattern) => ("_nlike", serde_json::Value::String(pattern.clone())),
        }
    }
}

fn is_operator(name: &str) -> bool {
    matches!(
        name,
        "_eq" | "_ne" | "_lt" | "_le" | "_gt" | "_ge" | "_in" | "_nin" | "_like" | "_nlike"
    )
}

fn parse_op(name: &str, value: &ArgValue) -> Result<FilterOp> {
    let scalar = |value: &ArgValue| -> Result<Value> {
        match value {
            ArgValue::Scalar(scalar) => Ok(scalar.clone()),
            _ => Err(DbError::Unmarshal(format!(
                "operator {name} expects a scalar value"
            ))),
        }
    };
    let list = |value: &ArgValue| -> Result<Vec<Value>> {
        match value {
            ArgValue::List(items) => items
                .iter()
                .map(|item| match item {
                    ArgValue::Scalar(scalar) => Ok(scalar.clone()),
                    _ => Err(DbError::Unmarshal(format!(
                        "operator {name} expects scalar list items"
                    ))),
                })
                .collect(),
            _ => Err(DbError::Unmarshal(format!("operator {name} expects a list"))),
        }
    };
    let text = |value: &ArgValue| -> Result<String> {
        match value {
            ArgValue::Scalar(Value::String(text)) => Ok(text.clone()),
            _ => Err(DbError::Unmarshal(format!(
                "operator {name} expects a string pattern"
            ))),
        }
    };

    Ok(match name {
        "_eq" => FilterOp::Eq(scalar(value)?),
        "_ne" => FilterOp::Ne(scalar(value)?),
        "_lt" => FilterOp::Lt(scalar(value)?),
        "_le" => FilterOp::Le(scalar(value)?),
        "_gt" => FilterOp::Gt(scalar(value)?),
        "_ge" => FilterOp::Ge(scalar(value)?),
        "_in" => FilterOp::In(list(value)?),
        "_nin" => FilterOp::Nin(list(value)?),
        "_like" => FilterOp::Like(text(value)?),
        "_nlike" => FilterOp::Nlike(text(value)?),
        other => return Err(DbError::UnsupportedOperator(other.to_string())),
    })
}

/// `%` matches any run of characters; everything else is literal.
fn like_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut remaining = text;
    for (idx, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if idx == 0 {
            match remaining.strip_prefix(part) {
                Some(rest) => remaining = rest,
                None => return false,
            }
        } else if idx == parts.len() - 1 {
            return remaining.ends_with(part);
        } else {
            match remaining.find(part) {
                Some(pos) => remaining = &remaining[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::parse_request;

    fn filter_from(source: &str) -> Filter {
        let request = parse_request(source, None).unwrap();
        let arg = request.selections[0].argument("filter").unwrap().clone();
        Filter::from_arg(&arg).unwrap()
    }

    fn row(mapping: &DocumentMapping, values: Vec<Value>) -> Doc {
        let mut doc = mapping.new_doc();
        doc.fields = values;
        doc
    }

    fn height_mapping() -> DocumentMapping {
        let mut mapping = DocumentMapping::new();
        mapping.add("Name", Some("Name".to_string()), None);
        mapping.add("HeightM", None, None);
        mapping
    }

    #[test]
    fn le_includes_equal_and_crosses_int_float() -> anyhow::Result<()> {
        let mapping = height_mapping();
        let filter = filter_from("query { users(filter: {HeightM: {_le: 1.82}}) { Name } }");

        let bob = row(&mapping, vec![Value::String("Bob".into()), Value::Float(1.82)]);
        let john = row(&mapping, vec![Value::String("John".into()), Value::Float(2.1)]);
        assert!(filter.matches(&bob, &mapping)?);
        assert!(!filter.matches(&john, &mapping)?);

        // An integer bound compares against float cells.
        let filter = filter_from("query { users(filter: {HeightM: {_le: 2}}) { Name } }");
        assert!(filter.matches(&bob, &mapping)?);
        assert!(!filter.matches(&john, &mapping)?);
        Ok(())
    }

    #[test]
    fn le_null_matches_only_missing_values() -> anyhow::Result<()> {
        let mapping = height_mapping();
        let filter = filter_from("query { users(filter: {HeightM: {_le: null}}) { Name } }");

        let bob = row(&mapping, vec![Value::String("Bob".into()), Value::Null]);
        let john = row(&mapping, vec![Value::String("John".into()), Value::Float(2.1)]);
        assert!(filter.matches(&bob, &mapping)?);
        assert!(!filter.matches(&john, &mapping)?);
        Ok(())
    }

    #[test]
    fn boolean_composition() -> anyhow::Result<()> {
        let mapping = height_mapping();
        let filter = filter_from(
            "query { users(filter: {_or: [{Name: {_eq: \"Bob\"}}, {HeightM: {_gt: 2.0}}]}) { Name } }",
        );
        let bob = row(&mapping, vec![Value::String("Bob".into()), Value::Float(1.0)]);
        let john = row(&mapping, vec![Value::String("John".into()), Value::Float(2.1)]);
        let fred = row(&mapping, vec![Value::String("Fred".into()), Value::Float(1.5)]);
        assert!(filter.matches(&bob, &mapping)?);
        assert!(filter.matches(&john, &mapping)?);
        assert!(!filter.matches(&fred, &mapping)?);
        Ok(())
    }

    #[test]
    fn in_and_like_operators() -> anyhow::Result<()> {
        let mapping = height_mapping();
        let filter =
            filter_from("query { users(filter: {Name: {_in: [\"Bob\", \"Fred\"]}}) { Name } }");
        let bob = row(&mapping, vec![Value::String("Bob".into()), Value::Null]);
        let john = row(&mapping, vec![Value::String("John".into()), Value::Null]);
        assert!(filter.matches(&bob, &mapping)?);
        assert!(!filter.matches(&john, &mapping)?);

        let filter = filter_from("query { users(filter: {Name: {_like: \"Jo%\"}}) { Name } }");
        assert!(filter.matches(&john, &mapping)?);
        assert!(!filter.matches(&bob, &mapping)?);

        let filter = filter_from("query { users(filter: {Name: {_like: \"%o%\"}}) { Name } }");
        assert!(filter.matches(&john, &mapping)?);
        assert!(filter.matches(&bob, &mapping)?);
        Ok(())
    }

    #[test]
    fn element_predicates_apply_to_bare_values() -> anyhow::Result<()> {
        // The form aggregates pass over scalar sequences: ops at the top
        // level, no field names.
        let filter = filter_from("query { users(filter: {_gt: 2}) { Name } }");
        assert!(matches!(filter, Filter::Element(_)));
        assert!(filter.matches_value(&Value::Int(3))?);
        assert!(!filter.matches_value(&Value::Int(2))?);

        let filter = filter_from("query { users(filter: {_like: \"b%\"}) { Name } }");
        assert!(filter.matches_value(&Value::String("buddy".into()))?);
        assert!(!filter.matches_value(&Value::String("pal".into()))?);

        // An element predicate cannot be evaluated against a document row.
        let mapping = height_mapping();
        let doc = mapping.new_doc();
        let filter = filter_from("query { users(filter: {_gt: 2}) { Name } }");
        assert!(filter.matches(&doc, &mapping).is_err());
        Ok(())
    }

    #[test]
    fn unsupported_operator_is_rejected() {
        let request =
            parse_request("query { users(filter: {Name: {_regex: \"x\"}}) { Name } }", None)
                .unwrap();
        let arg = request.selections[0].argument("filter").unwrap().clone();
        assert!(matches!(
            Filter::from_arg(&arg).unwrap_err(),
            DbError::UnsupportedOperator(_)
        ));
    }

    #[test]
    fn key_lookup_detects_primary_key_equality() {
        let filter = filter_from(
            "query { users(filter: {_key: {_eq: \"bae-123\"}}) { Name } }",
        );
        assert_eq!(filter.key_lookup(), Some("bae-123".to_string()));
    }
}
