//! Runtime values and document rows.
//!
//! Every cell a plan node touches is a [`Value`]. The element kinds are
//! enumerated explicitly (no downcasting): scalars, document keys, and the
//! nested document shapes produced by joins and grouping.

use std::cmp::Ordering;

use libipld::ipld::Ipld;
use serde_json::{Number, Value as Json};

use crate::error::{DbError, Result};
use crate::schema::FieldKind;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DocKey(String),
    /// A scalar sequence: the materialized value of a `[Bool]`/`[Int]`/
    /// `[Float]`/`[String]` field.
    List(Vec<Value>),
    /// A joined one-to-one child document.
    Doc(Box<Doc>),
    /// A joined one-to-many child set, or a `_group` projection.
    Docs(Vec<Doc>),
}

/// A positional row. Cells are addressed through the `DocumentMapping` built
/// at plan time; `hidden` masks rows that grouping has folded away.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Doc {
    pub fields: Vec<Value>,
    pub hidden: bool,
}

impl Doc {
    pub fn with_len(len: usize) -> Self {
        Doc {
            fields: vec![Value::Null; len],
            hidden: false,
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_dockey(&self) -> Option<&str> {
        match self {
            Value::DocKey(key) => Some(key),
            Value::String(key) => Some(key),
            _ => None,
        }
    }

    /// Encoding used for materialized field values and dockey derivation.
    pub fn to_ipld(&self) -> Ipld {
        match self {
            Value::Null => Ipld::Null,
            Value::Bool(value) => Ipld::Bool(*value),
            Value::Int(value) => Ipld::Integer(*value as i128),
            Value::Float(value) => Ipld::Float(*value),
            Value::String(value) => Ipld::String(value.clone()),
            Value::DocKey(value) => Ipld::String(value.clone()),
            Value::List(items) => Ipld::List(items.iter().map(Value::to_ipld).collect()),
            // Nested rows are runtime-only, they are never persisted.
            Value::Doc(_) | Value::Docs(_) => Ipld::Null,
        }
    }

    /// Decode a stored value for a field of the given kind.
    pub fn from_ipld(ipld: &Ipld, kind: FieldKind) -> Value {
        match (ipld, kind) {
            (Ipld::Null, _) => Value::Null,
            (Ipld::Bool(value), _) => Value::Bool(*value),
            (Ipld::Integer(value), FieldKind::Float) => Value::Float(*value as f64),
            (Ipld::Integer(value), _) => Value::Int(*value as i64),
            (Ipld::Float(value), _) => Value::Float(*value),
            (Ipld::String(value), FieldKind::DocKey) => Value::DocKey(value.clone()),
            (Ipld::String(value), _) => Value::String(value.clone()),
            (Ipld::List(items), kind) => match kind.element() {
                Some(element) => Value::List(
                    items
                        .iter()
                        .map(|item| Value::from_ipld(item, element))
                        .collect(),
                ),
                None => Value::Null,
            },
            _ => Value::Null,
        }
    }

    /// Convert user-provided JSON (mutation `data`) into a typed value.
    pub fn from_json(json: &Json, kind: FieldKind, field: &str) -> Result<Value> {
        if let (Json::Array(items), Some(element)) = (json, kind.element()) {
            let items = items
                .iter()
                .map(|item| Value::from_json(item, element, field))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Value::List(items));
        }
        let value = match (json, kind) {
            (Json::Null, _) => Value::Null,
            (Json::Bool(value), FieldKind::Bool) => Value::Bool(*value),
            (Json::Number(num), FieldKind::Int) => {
                let int = num
                    .as_i64()
                    .ok_or_else(|| DbError::Unmarshal(format!("{field} is not an integer")))?;
                Value::Int(int)
            }
            (Json::Number(num), FieldKind::Float) => {
                let float = num
                    .as_f64()
                    .ok_or_else(|| DbError::Unmarshal(format!("{field} is not a number")))?;
                Value::Float(float)
            }
            (Json::String(value), FieldKind::String | FieldKind::DateTime) => {
                Value::String(value.clone())
            }
            (Json::String(value), FieldKind::DocKey) => Value::DocKey(value.clone()),
            _ => {
                return Err(DbError::Unmarshal(format!(
                    "value for field {field} does not match its kind"
                )))
            }
        };
        Ok(value)
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(value) => Json::Bool(*value),
            Value::Int(value) => Json::Number(Number::from(*value)),
            Value::Float(value) => Number::from_f64(*value)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(value) => Json::String(value.clone()),
            Value::DocKey(value) => Json::String(value.clone()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            // Doc/Docs render through their mapping, not here.
            Value::Doc(_) | Value::Docs(_) => Json::Null,
        }
    }
}

/// Ordering comparison for filters. Numeric kinds compare across Int/Float;
/// incomparable kinds (including anything against Null) yield `None`.
pub fn cmp_values(left: &Value, right: &Value) -> Option<Ordering> {
    use Value::*;
    match (left, right) {
        (Int(a), Int(b)) => Some(a.cmp(b)),
        (Float(a), Float(b)) => Some(a.total_cmp(b)),
        (Int(a), Float(b)) => Some((*a as f64).total_cmp(b)),
        (Float(a), Int(b)) => Some(a.total_cmp(&(*b as f64))),
        (String(a), String(b)) => Some(a.cmp(b)),
        (DocKey(a), DocKey(b)) => Some(a.cmp(b)),
        (String(a), DocKey(b)) | (DocKey(b), String(a)) => Some(a.cmp(b)),
        (Bool(a), Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Equality for filters: `Null == Null`, numeric kinds compare across
/// Int/Float, everything else must match in kind.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    if left.is_null() || right.is_null() {
        return left.is_null() && right.is_null();
    }
    cmp_values(left, right) == Some(Ordering::Equal)
}

/// Total order used for sorting and group keys: values order by kind rank
/// first, then within kind; `Null` sorts after everything.
pub fn total_cmp_values(left: &Value, right: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Bool(_) => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::String(_) | Value::DocKey(_) => 2,
            Value::List(_) => 3,
            Value::Doc(_) => 4,
            Value::Docs(_) => 5,
            Value::Null => 6,
        }
    }
    match cmp_values(left, right) {
        Some(ordering) => ordering,
        None => rank(left).cmp(&rank(right)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_numeric_comparison() {
        assert_eq!(
            cmp_values(&Value::Float(1.82), &Value::Int(2)),
            Some(Ordering::Less)
        );
        assert_eq!(
            cmp_values(&Value::Int(2), &Value::Float(1.82)),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn null_is_only_equal_to_null() {
        assert!(values_equal(&Value::Null, &Value::Null));
        assert!(!values_equal(&Value::Null, &Value::Int(0)));
        assert!(cmp_values(&Value::Null, &Value::Int(0)).is_none());
    }

    #[test]
    fn scalar_lists_roundtrip_through_ipld_and_json() -> crate::error::Result<()> {
        let json = serde_json::json!([1, 2, 3]);
        let value = Value::from_json(&json, FieldKind::IntArray, "favouriteNumbers")?;
        assert_eq!(
            value,
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );

        let ipld = value.to_ipld();
        assert_eq!(Value::from_ipld(&ipld, FieldKind::IntArray), value);
        assert_eq!(value.to_json(), json);

        // Element kind mismatches are rejected.
        let bad = serde_json::json!([1, "two"]);
        assert!(Value::from_json(&bad, FieldKind::IntArray, "favouriteNumbers").is_err());
        Ok(())
    }

    #[test]
    fn ipld_roundtrip_respects_kind() {
        let value = Value::DocKey("bae-123".to_string());
        let ipld = value.to_ipld();
        assert_eq!(Value::from_ipld(&ipld, FieldKind::DocKey), value);

        // An integer literal read back into a float field widens.
        let ipld = Ipld::Integer(2);
        assert_eq!(Value::from_ipld(&ipld, FieldKind::Float), Value::Float(2.0));
    }
}
