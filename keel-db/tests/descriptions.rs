//! Schema compilation: collection descriptions and relation metadata.

use keel_db::schema::{
    compile_sdl, CrdtKind, FieldKind, RelationManager, RelationType, SchemaDescription,
};

fn compile(sdl: &str) -> anyhow::Result<Vec<SchemaDescription>> {
    let mut rm = RelationManager::new();
    Ok(compile_sdl(sdl, &mut rm)?)
}

/// `(name, kind, crdt)` triples in canonical order.
fn shape(schema: &SchemaDescription) -> Vec<(&str, FieldKind, CrdtKind)> {
    schema
        .fields
        .iter()
        .map(|field| (field.name.as_str(), field.kind, field.crdt))
        .collect()
}

#[test]
fn single_simple_type() -> anyhow::Result<()> {
    let schemas = compile(
        "type user {
            name: String
            age: Int
            verified: Boolean
        }",
    )?;
    assert_eq!(schemas.len(), 1);
    let user = &schemas[0];
    assert_eq!(user.name, "user");
    assert_eq!(
        shape(user),
        vec![
            ("_key", FieldKind::DocKey, CrdtKind::None),
            ("age", FieldKind::Int, CrdtKind::LwwRegister),
            ("name", FieldKind::String, CrdtKind::LwwRegister),
            ("verified", FieldKind::Bool, CrdtKind::LwwRegister),
        ]
    );
    // Field ids are the canonical positions.
    for (position, field) in user.fields.iter().enumerate() {
        assert_eq!(field.id, position as u32);
    }
    assert!(!user.version_id.is_empty());
    Ok(())
}

#[test]
fn multiple_simple_types() -> anyhow::Result<()> {
    let schemas = compile(
        "type user {
            name: String
            age: Int
            verified: Boolean
        }

        type author {
            name: String
            publisher: String
            rating: Float
        }",
    )?;
    assert_eq!(schemas.len(), 2);
    assert_eq!(schemas[0].name, "user");
    assert_eq!(schemas[1].name, "author");
    assert_eq!(
        shape(&schemas[1]),
        vec![
            ("_key", FieldKind::DocKey, CrdtKind::None),
            ("name", FieldKind::String, CrdtKind::LwwRegister),
            ("publisher", FieldKind::String, CrdtKind::LwwRegister),
            ("rating", FieldKind::Float, CrdtKind::LwwRegister),
        ]
    );
    Ok(())
}

#[test]
fn scalar_array_kinds() -> anyhow::Result<()> {
    let schemas = compile(
        "type user {
            name: String
            favouriteNumbers: [Int]
            nicknames: [String]
            flags: [Boolean]
            scores: [Float]
        }",
    )?;
    let user = &schemas[0];
    assert_eq!(
        shape(user),
        vec![
            ("_key", FieldKind::DocKey, CrdtKind::None),
            ("favouriteNumbers", FieldKind::IntArray, CrdtKind::LwwRegister),
            ("flags", FieldKind::BoolArray, CrdtKind::LwwRegister),
            ("name", FieldKind::String, CrdtKind::LwwRegister),
            ("nicknames", FieldKind::StringArray, CrdtKind::LwwRegister),
            ("scores", FieldKind::FloatArray, CrdtKind::LwwRegister),
        ]
    );
    assert_eq!(FieldKind::IntArray.element(), Some(FieldKind::Int));

    // A list of an undeclared type is still rejected.
    assert!(compile("type user { tags: [Tag] }").is_err());
    Ok(())
}

#[test]
fn one_to_one_relation_fields() -> anyhow::Result<()> {
    let schemas = compile(
        "type book {
            name: String
            rating: Float
            author: author
        }

        type author {
            name: String
            age: Int
            published: book
        }",
    )?;

    let book = &schemas[0];
    // No @primary anywhere: the side declared second (author.published) is
    // promoted, so the foreign key lives on author only.
    assert_eq!(
        shape(book),
        vec![
            ("_key", FieldKind::DocKey, CrdtKind::None),
            ("author", FieldKind::ForeignObject, CrdtKind::None),
            ("name", FieldKind::String, CrdtKind::LwwRegister),
            ("rating", FieldKind::Float, CrdtKind::LwwRegister),
        ]
    );
    let author_field = book.fields.iter().find(|f| f.name == "author").unwrap();
    assert_eq!(author_field.relation_name.as_deref(), Some("author_book"));
    assert_eq!(author_field.schema.as_deref(), Some("author"));
    assert!(author_field.relation_type.contains(RelationType::ONE));
    assert!(author_field.relation_type.contains(RelationType::ONEONE));
    assert!(!author_field.is_primary_relation());

    let author = &schemas[1];
    assert_eq!(
        shape(author),
        vec![
            ("_key", FieldKind::DocKey, CrdtKind::None),
            ("published", FieldKind::ForeignObject, CrdtKind::None),
            ("published_id", FieldKind::DocKey, CrdtKind::LwwRegister),
            ("age", FieldKind::Int, CrdtKind::LwwRegister),
            ("name", FieldKind::String, CrdtKind::LwwRegister),
        ]
    );
    let published = author.fields.iter().find(|f| f.name == "published").unwrap();
    assert!(published.is_primary_relation());
    assert_eq!(published.relation_name.as_deref(), Some("author_book"));
    let mirror = author.fields.iter().find(|f| f.name == "published_id").unwrap();
    assert!(mirror.is_internal_id());
    assert_eq!(mirror.crdt, CrdtKind::LwwRegister);
    Ok(())
}

#[test]
fn one_to_one_explicit_primary_side() -> anyhow::Result<()> {
    let schemas = compile(
        "type book {
            name: String
            author: author @primary
        }

        type author {
            name: String
            published: book
        }",
    )?;

    let book = &schemas[0];
    let author_field = book.fields.iter().find(|f| f.name == "author").unwrap();
    assert!(author_field.is_primary_relation());
    assert!(book.fields.iter().any(|f| f.name == "author_id"));

    let author = &schemas[1];
    let published = author.fields.iter().find(|f| f.name == "published").unwrap();
    assert!(!published.is_primary_relation());
    assert!(!author.fields.iter().any(|f| f.name == "published_id"));
    Ok(())
}

#[test]
fn one_to_many_foreign_key_lives_on_the_single_side() -> anyhow::Result<()> {
    let schemas = compile(
        "type book {
            name: String
            rating: Float
            author: author
        }

        type author {
            name: String
            age: Int
            published: [book]
        }",
    )?;

    let book = &schemas[0];
    let author_field = book.fields.iter().find(|f| f.name == "author").unwrap();
    assert!(author_field.relation_type.contains(RelationType::ONEMANY));
    assert!(author_field.is_primary_relation());
    assert!(book.fields.iter().any(|f| f.name == "author_id"));

    let author = &schemas[1];
    let published = author.fields.iter().find(|f| f.name == "published").unwrap();
    assert_eq!(published.kind, FieldKind::ForeignObjectArray);
    assert!(published.relation_type.contains(RelationType::MANY));
    assert!(!published.is_primary_relation());
    assert!(!author.fields.iter().any(|f| f.name == "published_id"));
    Ok(())
}

#[test]
fn relation_name_directive_overrides_canonical_name() -> anyhow::Result<()> {
    let schemas = compile(
        "type book {
            name: String
            author: author @relation(name: \"authorship\")
        }

        type author {
            name: String
            published: book @relation(name: \"authorship\")
        }",
    )?;
    let book = &schemas[0];
    let field = book.fields.iter().find(|f| f.name == "author").unwrap();
    assert_eq!(field.relation_name.as_deref(), Some("authorship"));
    Ok(())
}

#[test]
fn identical_sdl_yields_identical_version_ids() -> anyhow::Result<()> {
    let sdl = "type user { name: String age: Int }";
    let first = compile(sdl)?;
    let second = compile(sdl)?;
    assert_eq!(first[0].version_id, second[0].version_id);

    let other = compile("type user { name: String age: Int verified: Boolean }")?;
    assert_ne!(first[0].version_id, other[0].version_id);
    Ok(())
}

#[test]
fn unknown_kind_and_duplicate_field_are_rejected() {
    assert!(compile("type user { name: Strange }").is_err());
    assert!(compile("type user { name: String name: Int }").is_err());
    assert!(compile("types user { name: String }").is_err());
}
