use std::collections::BTreeMap;

use serde_json::Value;

/// How a path segment classifies on a given record.
///
/// An attribute with the same name as a relation shadows it, matching the
/// lookup order column paths are resolved with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Attribute,
    ToOneRelation,
    ToManyRelation,
    Unknown,
}

/// A loaded relation value on a record.
#[derive(Debug, Clone)]
pub enum RelationValue {
    /// To-one relation; `None` when nothing is related.
    ToOne(Option<Box<Record>>),
    /// To-many relation with zero or more related records.
    ToMany(Vec<Record>),
}

/// One materialized record of the host's entity graph.
///
/// The durable store is an external collaborator; what the export pipeline
/// sees is this in-memory projection: scalar attributes (JSON values) plus
/// loaded relations keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Record {
    attributes: BTreeMap<String, Value>,
    relations: BTreeMap<String, RelationValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_to_one(mut self, name: impl Into<String>, related: Option<Record>) -> Self {
        self.relations
            .insert(name.into(), RelationValue::ToOne(related.map(Box::new)));
        self
    }

    pub fn with_to_many(mut self, name: impl Into<String>, related: Vec<Record>) -> Self {
        self.relations.insert(name.into(), RelationValue::ToMany(related));
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationValue> {
        self.relations.get(name)
    }

    /// Capability query used by the path resolver.
    pub fn segment_kind(&self, name: &str) -> SegmentKind {
        if self.has_attribute(name) {
            return SegmentKind::Attribute;
        }
        match self.relations.get(name) {
            Some(RelationValue::ToOne(_)) => SegmentKind::ToOneRelation,
            Some(RelationValue::ToMany(_)) => SegmentKind::ToManyRelation,
            None => SegmentKind::Unknown,
        }
    }

    /// The record's id attribute, stringified, for explicit-id loads.
    pub fn id_string(&self) -> Option<String> {
        self.attribute("id").map(stringify)
    }
}

/// Blankness test for cell state.
///
/// Null, empty or whitespace-only strings, and empty lists are blank;
/// `false`, `0` and other present-but-falsy values are not.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Render a cell value as text.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_shadows_relation() {
        let record = Record::new()
            .with_attribute("author", "inline name")
            .with_to_one("author", Some(Record::new().with_attribute("name", "x")));

        assert_eq!(record.segment_kind("author"), SegmentKind::Attribute);
    }

    #[test]
    fn test_segment_kinds() {
        let record = Record::new()
            .with_attribute("title", "a post")
            .with_to_one("author", None)
            .with_to_many("tags", vec![]);

        assert_eq!(record.segment_kind("title"), SegmentKind::Attribute);
        assert_eq!(record.segment_kind("author"), SegmentKind::ToOneRelation);
        assert_eq!(record.segment_kind("tags"), SegmentKind::ToManyRelation);
        assert_eq!(record.segment_kind("nope"), SegmentKind::Unknown);
    }

    #[test]
    fn test_is_blank() {
        assert!(is_blank(&Value::Null));
        assert!(is_blank(&json!("")));
        assert!(is_blank(&json!("   ")));
        assert!(is_blank(&json!([])));
        assert!(!is_blank(&json!(false)));
        assert!(!is_blank(&json!(0)));
        assert!(!is_blank(&json!("0")));
        assert!(!is_blank(&json!(["a"])));
    }

    #[test]
    fn test_stringify() {
        assert_eq!(stringify(&Value::Null), "");
        assert_eq!(stringify(&json!(true)), "true");
        assert_eq!(stringify(&json!(12.5)), "12.5");
        assert_eq!(stringify(&json!("text")), "text");
        assert_eq!(stringify(&json!(["a", "b"])), r#"["a","b"]"#);
    }
}
