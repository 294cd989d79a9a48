//! SDL compilation: schema text to collection descriptions.

use graphql_parser::schema::{Definition, ObjectType, Type, TypeDefinition, Value};

use keel_store::cid_for;

use crate::error::{DbError, Result};
use crate::schema::{
    relation_name, CrdtKind, FieldDescription, FieldKind, RelationManager, RelationType,
    SchemaDescription, ID_SUFFIX, KEY_FIELD,
};

/// Compile a schema-definition document into schema descriptions (without
/// collection ids, those are assigned at registration) and register its
/// relations into `rm`. Validation runs in here, so the returned
/// descriptions already reflect primary assignment.
pub fn compile_sdl(sdl: &str, rm: &mut RelationManager) -> Result<Vec<SchemaDescription>> {
    let document = graphql_parser::parse_schema::<String>(sdl)
        .map_err(|err| DbError::ParseSyntax(err.to_string()))?;

    let objects: Vec<&ObjectType<'_, String>> = document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            Definition::TypeDefinition(TypeDefinition::Object(object)) => Some(object),
            _ => None,
        })
        .collect();

    let declared: Vec<String> = objects.iter().map(|object| object.name.clone()).collect();

    // First pass: classify fields and register relation ends in declaration
    // order, so auto-primary promotion sees them in source order.
    let mut parsed_types = Vec::new();
    for object in &objects {
        let mut fields: Vec<ParsedField> = Vec::new();
        for field in &object.fields {
            if field.name == KEY_FIELD || fields.iter().any(|parsed| parsed.name == field.name) {
                return Err(DbError::DuplicateField(field.name.clone()));
            }
            let (kind, target, required) = classify(&field.field_type, &declared)?;

            let mut rel_name = None;
            if let Some(target) = &target {
                let name = field
                    .directives
                    .iter()
                    .find(|directive| directive.name == "relation")
                    .and_then(|directive| {
                        directive.arguments.iter().find_map(|(arg, value)| match value {
                            Value::String(name) if arg == "name" => Some(name.clone()),
                            _ => None,
                        })
                    })
                    .unwrap_or_else(|| relation_name(&object.name, target));

                let primary = field
                    .directives
                    .iter()
                    .any(|directive| directive.name == "primary");
                let arity = if kind == FieldKind::ForeignObjectArray {
                    RelationType::MANY
                } else {
                    RelationType::ONE
                };
                let rel_type = if primary {
                    arity | RelationType::PRIMARY
                } else {
                    arity
                };
                rm.register_single(&name, &object.name, target, &field.name, rel_type);
                rel_name = Some(name);
            }

            fields.push(ParsedField {
                name: field.name.clone(),
                kind,
                required,
                target,
                rel_name,
            });
        }
        parsed_types.push((object.name.clone(), fields));
    }

    rm.validate()?;

    // Second pass: emit descriptions in the canonical field order: `_key`
    // first, relation fields with their `_id` mirrors in declaration order,
    // then the remaining scalars alphabetically.
    let mut schemas = Vec::new();
    for (type_name, fields) in parsed_types {
        let mut relation_fields = Vec::new();
        let mut scalar_fields = Vec::new();

        for parsed in fields {
            if parsed.kind.is_object() {
                let rel_name = parsed
                    .rel_name
                    .expect("object fields always carry a relation name");
                let relation = rm
                    .relation(&rel_name)
                    .ok_or_else(|| DbError::InvalidRelation(rel_name.clone()))?;
                let side = relation.side(&type_name, &parsed.name).ok_or_else(|| {
                    DbError::InvalidRelation(format!(
                        "{rel_name}: side {type_name}.{} missing",
                        parsed.name
                    ))
                })?;
                let is_primary = side.is_primary();

                relation_fields.push(FieldDescription {
                    name: parsed.name.clone(),
                    id: 0,
                    kind: parsed.kind,
                    crdt: CrdtKind::None,
                    relation_name: Some(rel_name),
                    schema: parsed.target,
                    relation_type: side.rel_type,
                    required: parsed.required,
                });

                // The foreign key mirror exists only on the primary side.
                if is_primary {
                    relation_fields.push(FieldDescription {
                        name: format!("{}{ID_SUFFIX}", parsed.name),
                        id: 0,
                        kind: FieldKind::DocKey,
                        crdt: CrdtKind::LwwRegister,
                        relation_name: None,
                        schema: None,
                        relation_type: RelationType::INTERNAL_ID,
                        required: false,
                    });
                }
            } else {
                scalar_fields.push(FieldDescription {
                    name: parsed.name,
                    id: 0,
                    kind: parsed.kind,
                    crdt: CrdtKind::LwwRegister,
                    relation_name: None,
                    schema: None,
                    relation_type: RelationType::NONE,
                    required: parsed.required,
                });
            }
        }

        scalar_fields.sort_by(|a, b| a.name.cmp(&b.name));

        let mut all = Vec::with_capacity(relation_fields.len() + scalar_fields.len() + 1);
        all.push(FieldDescription {
            name: KEY_FIELD.to_string(),
            id: 0,
            kind: FieldKind::DocKey,
            crdt: CrdtKind::None,
            relation_name: None,
            schema: None,
            relation_type: RelationType::NONE,
            required: false,
        });
        all.extend(relation_fields);
        all.extend(scalar_fields);
        for (position, field) in all.iter_mut().enumerate() {
            field.id = position as u32;
        }

        let mut schema = SchemaDescription {
            name: type_name,
            version_id: String::new(),
            fields: all,
        };
        schema.version_id = version_id(&schema)?;
        schemas.push(schema);
    }

    Ok(schemas)
}

struct ParsedField {
    name: String,
    kind: FieldKind,
    required: bool,
    target: Option<String>,
    rel_name: Option<String>,
}

/// The schema version id is the CID of the canonical JSON serialization of
/// the description (with the version id itself blanked).
fn version_id(schema: &SchemaDescription) -> Result<String> {
    let bytes =
        serde_json::to_vec(schema).map_err(|err| DbError::Unmarshal(err.to_string()))?;
    Ok(cid_for(&bytes).to_string())
}

fn classify(
    field_type: &Type<'_, String>,
    declared: &[String],
) -> Result<(FieldKind, Option<String>, bool)> {
    match field_type {
        Type::NonNullType(inner) => {
            let (kind, target, _) = classify(inner, declared)?;
            Ok((kind, target, true))
        }
        Type::NamedType(name) => match name.as_str() {
            "Boolean" => Ok((FieldKind::Bool, None, false)),
            "Int" => Ok((FieldKind::Int, None, false)),
            "Float" => Ok((FieldKind::Float, None, false)),
            "String" => Ok((FieldKind::String, None, false)),
            "DateTime" => Ok((FieldKind::DateTime, None, false)),
            "ID" => Ok((FieldKind::DocKey, None, false)),
            other if declared.iter().any(|declared| declared == other) => {
                Ok((FieldKind::ForeignObject, Some(other.to_string()), false))
            }
            other => Err(DbError::UnknownKind(other.to_string())),
        },
        Type::ListType(inner) => match unwrap_named(inner) {
            Some("Boolean") => Ok((FieldKind::BoolArray, None, false)),
            Some("Int") => Ok((FieldKind::IntArray, None, false)),
            Some("Float") => Ok((FieldKind::FloatArray, None, false)),
            Some("String") => Ok((FieldKind::StringArray, None, false)),
            Some(named) if declared.iter().any(|declared| declared == named) => {
                Ok((FieldKind::ForeignObjectArray, Some(named.to_string()), false))
            }
            _ => Err(DbError::UnknownKind(field_type.to_string())),
        },
    }
}

fn unwrap_named<'a>(field_type: &'a Type<'_, String>) -> Option<&'a str> {
    match field_type {
        Type::NamedType(name) => Some(name),
        Type::NonNullType(inner) => unwrap_named(inner),
        Type::ListType(_) => None,
    }
}
