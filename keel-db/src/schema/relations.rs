//! Relation pairing and validation.
//!
//! Both sides of a relation resolve to the same relation name, either
//! user-supplied through `@relation(name: …)` or the alphabetical join of the
//! two type names. Validation pairs the sides, derives the cardinality shape,
//! and assigns the primary role (the side that stores the foreign key).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};
use crate::schema::RelationType;

/// Canonical relation name: the two type names, lowercased, joined in
/// alphabetical order.
pub fn relation_name(type_a: &str, type_b: &str) -> String {
    let a = type_a.to_lowercase();
    let b = type_b.to_lowercase();
    if a <= b {
        format!("{a}_{b}")
    } else {
        format!("{b}_{a}")
    }
}

/// One declared end of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSide {
    /// The type the field is declared on.
    pub source_type: String,
    /// The type the field points at.
    pub target_type: String,
    pub field_name: String,
    pub rel_type: RelationType,
}

impl RelationSide {
    pub fn is_primary(&self) -> bool {
        self.rel_type.contains(RelationType::PRIMARY)
    }
}

/// A validated relation: exactly two paired sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
    pub sides: [RelationSide; 2],
    /// The shape shared by both sides (`ONEONE`, `ONEMANY` or `MANYMANY`).
    pub shape: RelationType,
}

impl Relation {
    pub fn primary_side(&self) -> Option<&RelationSide> {
        self.sides.iter().find(|side| side.is_primary())
    }

    /// The side declared on `source_type` as `field_name`.
    pub fn side(&self, source_type: &str, field_name: &str) -> Option<&RelationSide> {
        self.sides
            .iter()
            .find(|side| side.source_type == source_type && side.field_name == field_name)
    }

    /// The counterpart of the side declared on `source_type` as `field_name`.
    pub fn other_side(&self, source_type: &str, field_name: &str) -> Option<&RelationSide> {
        let idx = self
            .sides
            .iter()
            .position(|side| side.source_type == source_type && side.field_name == field_name)?;
        Some(&self.sides[1 - idx])
    }

    /// Whether the primary field points at `target_type`. This mirrors how
    /// the relation registry is queried when expanding joins: the primary
    /// field lives on the opposite collection and stores the key of a
    /// `target_type` document.
    pub fn target_is_primary(&self, target_type: &str) -> bool {
        self.primary_side()
            .map(|side| side.target_type == target_type)
            .unwrap_or(false)
    }
}

/// Accumulates declared relation ends during schema compilation and pairs
/// them up at validation time.
#[derive(Debug, Default)]
pub struct RelationManager {
    pending: BTreeMap<String, Vec<RelationSide>>,
    relations: BTreeMap<String, Relation>,
}

impl RelationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one end of a relation. `rel_type` carries the arity
    /// (`ONE`/`MANY`) and, if annotated, the `PRIMARY` bit.
    pub fn register_single(
        &mut self,
        name: impl Into<String>,
        source_type: impl Into<String>,
        target_type: impl Into<String>,
        field_name: impl Into<String>,
        rel_type: RelationType,
    ) {
        let side = RelationSide {
            source_type: source_type.into(),
            target_type: target_type.into(),
            field_name: field_name.into(),
            rel_type,
        };
        self.pending.entry(name.into()).or_default().push(side);
    }

    /// Pair every registered end, derive shapes, and assign primary roles.
    pub fn validate(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for (name, sides) in pending {
            let relation = pair_sides(&name, sides)?;
            self.relations.insert(name, relation);
        }
        Ok(())
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    /// Merge validated relations from another manager (schema load batches).
    pub fn absorb(&mut self, other: RelationManager) {
        self.relations.extend(other.relations);
    }

    /// Insert an already-validated relation (description reload at startup).
    pub fn insert(&mut self, relation: Relation) {
        self.relations.insert(relation.name.clone(), relation);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relation> {
        self.relations.values()
    }
}

fn pair_sides(name: &str, mut sides: Vec<RelationSide>) -> Result<Relation> {
    if sides.len() != 2 {
        return Err(DbError::InvalidRelation(format!(
            "relation {name} must have exactly two sides, found {}",
            sides.len()
        )));
    }

    let one = RelationType::ONE;
    let arity = |side: &RelationSide| side.rel_type.contains(one);
    let shape = match (arity(&sides[0]), arity(&sides[1])) {
        (true, true) => RelationType::ONEONE,
        (true, false) | (false, true) => RelationType::ONEMANY,
        (false, false) => RelationType::MANYMANY,
    };

    let primaries = sides.iter().filter(|side| side.is_primary()).count();
    match shape {
        RelationType::ONEONE => match primaries {
            0 => {
                // Neither side annotated: the side declared second is
                // promoted to primary.
                sides[1].rel_type = sides[1].rel_type | RelationType::PRIMARY;
            }
            1 => {}
            _ => return Err(DbError::PrimaryConflict(name.to_string())),
        },
        RelationType::ONEMANY => {
            // The foreign key always lives with the single-object side.
            for side in sides.iter_mut() {
                if side.rel_type.contains(one) {
                    side.rel_type = side.rel_type | RelationType::PRIMARY;
                } else if side.is_primary() {
                    return Err(DbError::InvalidRelation(format!(
                        "relation {name}: the many side cannot be primary"
                    )));
                }
            }
        }
        _ => {
            if primaries > 0 {
                return Err(DbError::InvalidRelation(format!(
                    "relation {name}: many-to-many sides cannot be primary"
                )));
            }
        }
    }

    for side in sides.iter_mut() {
        side.rel_type = side.rel_type | shape;
    }

    let sides: [RelationSide; 2] = sides
        .try_into()
        .expect("length checked above");
    Ok(Relation {
        name: name.to_string(),
        sides,
        shape,
    })
}
