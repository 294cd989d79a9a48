//! Request parsing: GraphQL source to the typed operation AST.

pub mod filter;

pub use filter::{Filter, FilterOp};

use graphql_parser::query::{
    Definition, OperationDefinition, Selection as GqlSelection, SelectionSet, Value as GqlValue,
};
use serde_json::Value as Json;

use crate::error::{DbError, Result};
use crate::value::Value;

pub const VERSION_FIELD: &str = "_version";
pub const GROUP_FIELD: &str = "_group";
pub const COUNT_FIELD: &str = "_count";
pub const SUM_FIELD: &str = "_sum";
pub const AVG_FIELD: &str = "_avg";
pub const COMMITS_QUERY: &str = "commits";
pub const ALL_COMMITS_QUERY: &str = "allCommits";

pub const CREATE_PREFIX: &str = "create_";
pub const UPDATE_PREFIX: &str = "update_";
pub const DELETE_PREFIX: &str = "delete_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplainType {
    Simple,
    Execute,
}

/// A parsed request: one operation with its top-level selections.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub kind: OperationKind,
    pub explain: Option<ExplainType>,
    pub selections: Vec<Selection>,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub name: String,
    pub alias: Option<String>,
    pub arguments: Vec<(String, ArgValue)>,
    pub children: Vec<Selection>,
}

impl Selection {
    pub fn render_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn argument(&self, name: &str) -> Option<&ArgValue> {
        self.arguments
            .iter()
            .find(|(arg, _)| arg == name)
            .map(|(_, value)| value)
    }
}

/// Argument values, mirroring the GraphQL literal shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Scalar(Value),
    Enum(String),
    List(Vec<ArgValue>),
    Object(Vec<(String, ArgValue)>),
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Scalar(Value::String(text)) => Some(text),
            ArgValue::Scalar(Value::DocKey(text)) => Some(text),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ArgValue::Scalar(Value::Int(value)) if *value >= 0 => Some(*value as u64),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<Vec<String>> {
        match self {
            ArgValue::List(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&ArgValue> {
        match self {
            ArgValue::Object(entries) => entries
                .iter()
                .find(|(entry, _)| entry == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }
}

/// Parse GraphQL source into the first operation it defines.
///
/// `variables` resolves `$name` references from a JSON envelope.
pub fn parse_request(source: &str, variables: Option<&Json>) -> Result<ParsedRequest> {
    if source.trim().is_empty() {
        return Err(DbError::MissingRequest);
    }
    let document = graphql_parser::parse_query::<String>(source)
        .map_err(|err| DbError::ParseSyntax(err.to_string()))?;

    let operation = document
        .definitions
        .iter()
        .find_map(|definition| match definition {
            Definition::Operation(operation) => Some(operation),
            Definition::Fragment(_) => None,
        })
        .ok_or(DbError::MissingRequest)?;

    let (kind, directives, selection_set) = match operation {
        OperationDefinition::SelectionSet(set) => (OperationKind::Query, &[][..], set),
        OperationDefinition::Query(query) => {
            (OperationKind::Query, query.directives.as_slice(), &query.selection_set)
        }
        OperationDefinition::Mutation(mutation) => (
            OperationKind::Mutation,
            mutation.directives.as_slice(),
            &mutation.selection_set,
        ),
        OperationDefinition::Subscription(subscription) => (
            OperationKind::Subscription,
            subscription.directives.as_slice(),
            &subscription.selection_set,
        ),
    };

    let explain = directives
        .iter()
        .find(|directive| directive.name == "explain")
        .map(|directive| {
            match directive.arguments.iter().find(|(name, _)| name == "type") {
                None => Ok(ExplainType::Simple),
                Some((_, GqlValue::Enum(kind))) if kind == "simple" => Ok(ExplainType::Simple),
                Some((_, GqlValue::Enum(kind))) if kind == "execute" => Ok(ExplainType::Execute),
                Some(_) => Err(DbError::UnknownExplainRequestType),
            }
        })
        .transpose()?;

    let selections = convert_set(selection_set, variables)?;
    if selections.is_empty() {
        return Err(DbError::MissingRequest);
    }

    Ok(ParsedRequest {
        kind,
        explain,
        selections,
    })
}

fn convert_set(
    set: &SelectionSet<'_, String>,
    variables: Option<&Json>,
) -> Result<Vec<Selection>> {
    let mut selections = Vec::new();
    for item in &set.items {
        match item {
            GqlSelection::Field(field) => {
                let arguments = field
                    .arguments
                    .iter()
                    .map(|(name, value)| {
                        Ok((name.clone(), convert_value(value, variables)?))
                    })
                    .collect::<Result<Vec<_>>>()?;
                selections.push(Selection {
                    name: field.name.clone(),
                    alias: field.alias.clone(),
                    arguments,
                    children: convert_set(&field.selection_set, variables)?,
                });
            }
            GqlSelection::FragmentSpread(_) | GqlSelection::InlineFragment(_) => {
                return Err(DbError::ParseSyntax(
                    "fragments are not supported".to_string(),
                ))
            }
        }
    }
    Ok(selections)
}

fn convert_value(value: &GqlValue<'_, String>, variables: Option<&Json>) -> Result<ArgValue> {
    let converted = match value {
        GqlValue::Null => ArgValue::Scalar(Value::Null),
        GqlValue::Boolean(flag) => ArgValue::Scalar(Value::Bool(*flag)),
        GqlValue::Int(number) => ArgValue::Scalar(Value::Int(number.as_i64().ok_or_else(
            || DbError::ParseSyntax("integer literal out of range".to_string()),
        )?)),
        GqlValue::Float(number) => ArgValue::Scalar(Value::Float(*number)),
        GqlValue::String(text) => ArgValue::Scalar(Value::String(text.clone())),
        GqlValue::Enum(name) => ArgValue::Enum(name.clone()),
        GqlValue::List(items) => ArgValue::List(
            items
                .iter()
                .map(|item| convert_value(item, variables))
                .collect::<Result<Vec<_>>>()?,
        ),
        GqlValue::Object(entries) => ArgValue::Object(
            entries
                .iter()
                .map(|(name, value)| Ok((name.clone(), convert_value(value, variables)?)))
                .collect::<Result<Vec<_>>>()?,
        ),
        GqlValue::Variable(name) => {
            let json = variables
                .and_then(|vars| vars.get(name))
                .ok_or_else(|| DbError::Unmarshal(format!("undefined variable: ${name}")))?;
            json_to_arg(json)
        }
    };
    Ok(converted)
}

fn json_to_arg(json: &Json) -> ArgValue {
    match json {
        Json::Null => ArgValue::Scalar(Value::Null),
        Json::Bool(flag) => ArgValue::Scalar(Value::Bool(*flag)),
        Json::Number(number) => {
            if let Some(int) = number.as_i64() {
                ArgValue::Scalar(Value::Int(int))
            } else {
                ArgValue::Scalar(Value::Float(number.as_f64().unwrap_or_default()))
            }
        }
        Json::String(text) => ArgValue::Scalar(Value::String(text.clone())),
        Json::Array(items) => ArgValue::List(items.iter().map(json_to_arg).collect()),
        Json::Object(entries) => ArgValue::Object(
            entries
                .iter()
                .map(|(name, value)| (name.clone(), json_to_arg(value)))
                .collect(),
        ),
    }
}
