// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::schema::ModelSchema;
use crate::value::ScalarValue;
use indexmap::IndexMap;

/// A related object together with its junction-table row, when the relation
/// crosses one.
#[derive(Clone, Debug, PartialEq)]
pub struct RelatedObject {
    pub object: Object,
    pub through: Option<Object>,
}

impl RelatedObject {
    pub fn new(object: Object) -> Self {
        Self {
            object,
            through: None,
        }
    }

    pub fn with_through(object: Object, through: Option<Object>) -> Self {
        Self { object, through }
    }
}

/// Value of a relation field after materialization.
#[derive(Clone, Debug, PartialEq)]
pub enum Related {
    /// Forward FK or one-to-one: at most one related object.
    Single(Option<Box<RelatedObject>>),
    /// Reverse FK or many-to-many: all related objects, first-seen order.
    Many(Vec<RelatedObject>),
}

impl Related {
    pub fn as_single(&self) -> Option<&RelatedObject> {
        match self {
            Related::Single(v) => v.as_deref(),
            Related::Many(_) => None,
        }
    }

    pub fn as_many(&self) -> &[RelatedObject] {
        match self {
            Related::Single(_) => &[],
            Related::Many(v) => v,
        }
    }
}

/// A materialized model instance: plain field values, related objects keyed
/// by relation field name, and annotation values projected under aliases.
///
/// The annotations map doubles as the instance's auxiliary data store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Object {
    model: String,
    values: IndexMap<String, ScalarValue>,
    relations: IndexMap<String, Related>,
    annotations: IndexMap<String, ScalarValue>,
}

impl Object {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_owned(),
            ..Default::default()
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn get(&self, field: &str) -> Option<&ScalarValue> {
        self.values.get(field)
    }

    pub fn set(&mut self, field: &str, value: impl Into<ScalarValue>) {
        self.values.insert(field.to_owned(), value.into());
    }

    /// Builder-style `set`, for fixtures and call sites assembling objects
    /// inline.
    pub fn with(mut self, field: &str, value: impl Into<ScalarValue>) -> Self {
        self.set(field, value);
        self
    }

    pub fn values(&self) -> &IndexMap<String, ScalarValue> {
        &self.values
    }

    pub fn relation(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }

    pub fn relations(&self) -> &IndexMap<String, Related> {
        &self.relations
    }

    pub fn set_relation(&mut self, name: &str, related: Related) {
        self.relations.insert(name.to_owned(), related);
    }

    pub fn annotations(&self) -> &IndexMap<String, ScalarValue> {
        &self.annotations
    }

    pub fn annotation(&self, alias: &str) -> Option<&ScalarValue> {
        self.annotations.get(alias)
    }

    pub fn set_annotation(&mut self, alias: &str, value: ScalarValue) {
        self.annotations.insert(alias.to_owned(), value);
    }

    /// The value of the schema's primary field, `Null` when absent.
    pub fn primary_value(&self, schema: &ModelSchema) -> ScalarValue {
        schema
            .primary_field()
            .and_then(|f| self.values.get(&f.name).cloned())
            .unwrap_or(ScalarValue::Null)
    }

    /// Whether the object has a usable (non-zero) primary key.
    pub fn has_primary(&self, schema: &ModelSchema) -> bool {
        !self.primary_value(schema).is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType};

    #[test]
    fn test_primary_value() {
        let schema = ModelSchema::new(
            "User",
            "users",
            vec![
                FieldDef::new("ID", FieldType::I64).primary().auto(),
                FieldDef::new("Name", FieldType::Text),
            ],
        );
        let mut user = Object::new("User").with("Name", "Jane");
        assert!(!user.has_primary(&schema));
        user.set("ID", 3i64);
        assert!(user.has_primary(&schema));
        assert_eq!(user.primary_value(&schema), ScalarValue::I64(3));
    }

    #[test]
    fn test_relations_accessors() {
        let mut post = Object::new("Post");
        post.set_relation(
            "Tags",
            Related::Many(vec![RelatedObject::new(Object::new("Tag").with("ID", 1i64))]),
        );
        assert_eq!(post.relation("Tags").unwrap().as_many().len(), 1);
        assert!(post.relation("Tags").unwrap().as_single().is_none());
    }
}
