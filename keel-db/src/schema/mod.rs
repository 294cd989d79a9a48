//! Collection descriptions and the schema model.
//!
//! A collection description is the compiled form of one `type` block in the
//! schema definition: an ordered field list with kinds, CRDT types, and
//! relation metadata. Descriptions are persisted as JSON under
//! `/schema/collection/<name>` and never mutated afterwards.

mod descriptions;
mod relations;

pub use descriptions::compile_sdl;
pub use relations::{relation_name, Relation, RelationManager, RelationSide};

use serde::{Deserialize, Serialize};

/// Name of the implicit document-key field present on every collection.
pub const KEY_FIELD: &str = "_key";

/// Suffix of the synthesized foreign-key mirror of a primary relation field.
pub const ID_SUFFIX: &str = "_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    DocKey,
    Bool,
    Int,
    Float,
    DateTime,
    String,
    BoolArray,
    IntArray,
    FloatArray,
    StringArray,
    ForeignObject,
    ForeignObjectArray,
}

impl FieldKind {
    pub fn is_object(self) -> bool {
        matches!(self, FieldKind::ForeignObject | FieldKind::ForeignObjectArray)
    }

    /// Element kind of a scalar sequence; `None` for everything else.
    pub fn element(self) -> Option<FieldKind> {
        match self {
            FieldKind::BoolArray => Some(FieldKind::Bool),
            FieldKind::IntArray => Some(FieldKind::Int),
            FieldKind::FloatArray => Some(FieldKind::Float),
            FieldKind::StringArray => Some(FieldKind::String),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrdtKind {
    /// Immutable, set at document creation.
    None,
    /// Last-writer-wins register, the default for scalars.
    LwwRegister,
    /// Document-level register carrying field pointers and the delete flag.
    Composite,
}

/// Bitset describing a field's role in a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationType(pub u8);

impl RelationType {
    pub const NONE: RelationType = RelationType(0);
    /// Arity of this side.
    pub const ONE: RelationType = RelationType(1);
    pub const MANY: RelationType = RelationType(2);
    /// Cardinality shape of the whole relation.
    pub const ONEONE: RelationType = RelationType(4);
    pub const ONEMANY: RelationType = RelationType(8);
    pub const MANYMANY: RelationType = RelationType(16);
    /// This side stores the foreign key.
    pub const PRIMARY: RelationType = RelationType(64);
    /// Synthesized `<field>_id` scalar mirror.
    pub const INTERNAL_ID: RelationType = RelationType(128);

    pub fn contains(self, other: RelationType) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_set(self) -> bool {
        self.0 != 0
    }
}

impl std::ops::BitOr for RelationType {
    type Output = RelationType;

    fn bitor(self, rhs: RelationType) -> RelationType {
        RelationType(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescription {
    pub name: String,
    /// Dense id, the field's position in the canonical order. Used in
    /// materialized-value keys.
    pub id: u32,
    pub kind: FieldKind,
    pub crdt: CrdtKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_name: Option<String>,
    /// Target schema of a relation field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "relation_type_is_none")]
    pub relation_type: RelationType,
    #[serde(default)]
    pub required: bool,
}

fn relation_type_is_none(rt: &RelationType) -> bool {
    !rt.is_set()
}

impl FieldDescription {
    pub fn is_primary_relation(&self) -> bool {
        self.relation_type.contains(RelationType::PRIMARY)
    }

    pub fn is_internal_id(&self) -> bool {
        self.relation_type.contains(RelationType::INTERNAL_ID)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub name: String,
    /// CID of the canonical serialization of this schema version.
    pub version_id: String,
    pub fields: Vec<FieldDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDescription {
    pub id: u32,
    pub name: String,
    pub schema: SchemaDescription,
}

impl CollectionDescription {
    pub fn field(&self, name: &str) -> Option<&FieldDescription> {
        self.schema.fields.iter().find(|field| field.name == name)
    }

    pub fn field_by_id(&self, id: u32) -> Option<&FieldDescription> {
        self.schema.fields.iter().find(|field| field.id == id)
    }

    /// Scalar fields stored per document (everything except `_key` and the
    /// relation object fields).
    pub fn stored_fields(&self) -> impl Iterator<Item = &FieldDescription> {
        self.schema
            .fields
            .iter()
            .filter(|field| field.crdt == CrdtKind::LwwRegister)
    }
}
