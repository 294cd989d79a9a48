//! Result rendering: positional rows back to named JSON shapes.

use serde_json::{Map, Value as Json};

use crate::mapper::DocumentMapping;
use crate::value::{Doc, Value};

/// Serialize a row through its mapping. Internal cells (no render name) are
/// skipped; nested docs recurse through their child mapping.
pub fn render_doc(doc: &Doc, mapping: &DocumentMapping) -> Json {
    let mut out = Map::new();
    for mapped in mapping.fields() {
        let Some(render) = &mapped.render else {
            continue;
        };
        let value = doc.fields.get(mapped.index).unwrap_or(&Value::Null);
        let json = match (&mapped.child, value) {
            (Some(child), Value::Doc(nested)) => render_doc(nested, child),
            (Some(child), Value::Docs(nested)) => Json::Array(
                nested
                    .iter()
                    .filter(|row| !row.hidden)
                    .map(|row| render_doc(row, child))
                    .collect(),
            ),
            (Some(_), Value::Null) => Json::Null,
            (_, value) => value.to_json(),
        };
        out.insert(render.clone(), json);
    }
    Json::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_cells_do_not_render() {
        let mut mapping = DocumentMapping::new();
        mapping.add("_key", None, None);
        mapping.add("name", Some("name".to_string()), None);

        let mut doc = mapping.new_doc();
        doc.fields[0] = Value::DocKey("bae-1".into());
        doc.fields[1] = Value::String("Bob".into());

        let json = render_doc(&doc, &mapping);
        assert_eq!(json, serde_json::json!({"name": "Bob"}));
    }

    #[test]
    fn nested_docs_render_through_child_mapping() {
        let mut child = DocumentMapping::new();
        child.add("title", Some("title".to_string()), None);

        let mut mapping = DocumentMapping::new();
        mapping.add("_key", None, None);
        mapping.add("published", Some("books".to_string()), Some(child.clone()));

        let mut inner = child.new_doc();
        inner.fields[0] = Value::String("Painted House".into());
        let mut doc = mapping.new_doc();
        doc.fields[1] = Value::Docs(vec![inner]);

        let json = render_doc(&doc, &mapping);
        assert_eq!(
            json,
            serde_json::json!({"books": [{"title": "Painted House"}]})
        );
    }
}
