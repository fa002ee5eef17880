//! Entity attribute bag.
//!
//! An [`Entity`] is a named bag of fields plus a status word telling whether
//! it exists in the database and whether it has local, unsaved changes.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ContractViolation, Result};
use crate::value::Value;

/// Shared handle to an entity. Identity mapping hands out clones of the same
/// handle, so `Arc::ptr_eq` tells whether two lookups yielded one instance.
pub type EntityRef = Arc<RwLock<Entity>>;

/// Entity status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status(u8);

impl Status {
    pub const NONE: Status = Status(0);
    /// The entity has a row in the database.
    pub const EXIST: Status = Status(1);
    /// The entity has local changes not yet saved.
    pub const MODIFIED: Status = Status(2);

    #[inline]
    pub fn contains(self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn with(self, other: Status) -> Status {
        Status(self.0 | other.0)
    }

    #[inline]
    pub fn without(self, other: Status) -> Status {
        Status(self.0 & !other.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    kind: String,
    fields: BTreeMap<String, Value>,
    status: Status,
}

impl Entity {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: BTreeMap::new(),
            status: Status::NONE,
        }
    }

    pub fn with_fields<K, I>(kind: impl Into<String>, fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut entity = Self::new(kind);
        entity.fields = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        entity
    }

    /// Wrap into a shared handle.
    pub fn into_ref(self) -> EntityRef {
        Arc::new(RwLock::new(self))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn get(&self, field: &str) -> Result<&Value> {
        self.fields.get(field).ok_or_else(|| {
            ContractViolation::UnknownField {
                kind: self.kind.clone(),
                field: field.to_string(),
            }
            .into()
        })
    }

    pub fn has(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Set a field and flag the entity as modified.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
        self.status = self.status.with(Status::MODIFIED);
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        let removed = self.fields.remove(field);
        if removed.is_some() {
            self.status = self.status.with(Status::MODIFIED);
        }
        removed
    }

    /// Merge fresh field values without touching the status.
    pub fn hydrate(&mut self, fields: BTreeMap<String, Value>) {
        self.fields.extend(fields);
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn extract(&self) -> BTreeMap<String, Value> {
        self.fields.clone()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn is_new(&self) -> bool {
        !self.status.contains(Status::EXIST)
    }

    pub fn is_modified(&self) -> bool {
        self.status.contains(Status::MODIFIED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_flags_modified() {
        let mut book = Entity::new("Book");
        assert!(book.is_new());
        assert!(!book.is_modified());

        book.set("title", "t");
        assert!(book.is_modified());
        assert_eq!(book.get("title").unwrap(), &Value::Text("t".to_string()));
    }

    #[test]
    fn test_hydrate_keeps_status() {
        let mut book = Entity::new("Book");
        book.set_status(Status::EXIST);
        book.hydrate(BTreeMap::from([("id".to_string(), Value::Int(3))]));
        assert_eq!(book.status(), Status::EXIST);
        assert!(book.has("id"));
    }

    #[test]
    fn test_get_unknown_field() {
        let book = Entity::new("Book");
        let err = book.get("nope").unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Contract(ContractViolation::UnknownField { .. })
        ));
    }

    #[test]
    fn test_status_flags() {
        let s = Status::EXIST.with(Status::MODIFIED);
        assert!(s.contains(Status::EXIST));
        assert!(s.contains(Status::MODIFIED));
        assert_eq!(s.without(Status::MODIFIED), Status::EXIST);
    }
}
