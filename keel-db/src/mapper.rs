//! Document mapping: schema field names to dense row indices.
//!
//! Every planned select builds one mapping; plan nodes address row cells
//! exclusively by index. Related sub-selects recurse with their own child
//! mapping hung off the parent index. Entries without a render name are
//! internal (filter inputs, foreign keys, aggregate targets) and are not
//! serialized into results.

use std::collections::HashMap;

use crate::value::Doc;

#[derive(Debug, Clone)]
pub struct MappedField {
    pub index: usize,
    /// Schema (or virtual) field name used for lookups.
    pub name: String,
    /// Name the cell renders under; `None` keeps the cell internal.
    pub render: Option<String>,
    /// Mapping of a nested select (join child, `_group`, `_version`, links).
    pub child: Option<Box<DocumentMapping>>,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentMapping {
    fields: Vec<MappedField>,
    by_name: HashMap<String, usize>,
}

impl DocumentMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field and return its index. The first entry for a name wins the
    /// name lookup; later entries (hidden aggregate targets) stay reachable
    /// through their returned index.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        render: Option<String>,
        child: Option<DocumentMapping>,
    ) -> usize {
        let name = name.into();
        let index = self.fields.len();
        self.by_name.entry(name.clone()).or_insert(index);
        self.fields.push(MappedField {
            index,
            name,
            render,
            child: child.map(Box::new),
        });
        index
    }

    /// Index of a field, ensuring it exists as a hidden entry if absent.
    pub fn ensure(&mut self, name: &str) -> usize {
        match self.index_of(name) {
            Some(index) => index,
            None => self.add(name, None, None),
        }
    }

    /// Make the entry at `index` render under `render`.
    pub fn set_render(&mut self, index: usize, render: impl Into<String>) {
        self.fields[index].render = Some(render.into());
    }

    /// Attach the nested mapping of the entry at `index`.
    pub fn set_child(&mut self, index: usize, child: DocumentMapping) {
        self.fields[index].child = Some(Box::new(child));
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn field(&self, index: usize) -> &MappedField {
        &self.fields[index]
    }

    pub fn fields(&self) -> &[MappedField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// A fresh row sized for this mapping.
    pub fn new_doc(&self) -> Doc {
        Doc::with_len(self.fields.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_dense_and_stable() {
        let mut mapping = DocumentMapping::new();
        let key = mapping.add("_key", Some("_key".to_string()), None);
        let name = mapping.add("name", Some("name".to_string()), None);
        let hidden = mapping.add("age", None, None);

        assert_eq!((key, name, hidden), (0, 1, 2));
        assert_eq!(mapping.index_of("age"), Some(2));
        assert_eq!(mapping.new_doc().fields.len(), 3);
    }

    #[test]
    fn first_entry_wins_name_lookup() {
        let mut mapping = DocumentMapping::new();
        let visible = mapping.add("published", Some("published".to_string()), None);
        let hidden = mapping.add("published", None, None);
        assert_ne!(visible, hidden);
        assert_eq!(mapping.index_of("published"), Some(visible));
    }

    #[test]
    fn ensure_reuses_existing_entries() {
        let mut mapping = DocumentMapping::new();
        let age = mapping.add("age", Some("age".to_string()), None);
        assert_eq!(mapping.ensure("age"), age);
        assert_eq!(mapping.len(), 1);
    }
}
