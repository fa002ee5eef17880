//! Identity mapping: at most one in-memory instance per entity and primary
//! key within a connection.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::config::IdentityMapperKind;
use crate::entity::{Entity, EntityRef};
use crate::error::{ContractViolation, Result};
use crate::value::Value;

/// Entity kind plus its primary key values, in key order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    kind: String,
    primary_key: Vec<String>,
}

impl IdentityKey {
    /// Fails when `pk_fields` is empty or names a field the entity lacks.
    pub fn of(entity: &Entity, pk_fields: &[&str]) -> Result<Self> {
        if pk_fields.is_empty() {
            return Err(ContractViolation::EmptyPrimaryKey(entity.kind().to_string()).into());
        }
        let primary_key = pk_fields
            .iter()
            .map(|field| entity.get(field).map(key_part))
            .collect::<Result<_>>()?;
        Ok(Self {
            kind: entity.kind().to_string(),
            primary_key,
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

/// Values are not `Hash`; their debug form is unambiguous across variants
/// (`Int(1)` differs from `Text("1")`).
fn key_part(value: &Value) -> String {
    format!("{:?}", value)
}

#[derive(Debug)]
pub enum IdentityMapper {
    /// Every lookup yields the fresh instance.
    None,
    /// The first instance seen wins; later data is discarded.
    Strict(HashMap<IdentityKey, EntityRef>),
    /// The first instance wins but is refreshed with later data unless it
    /// carries local modifications.
    Smart(HashMap<IdentityKey, EntityRef>),
}

impl IdentityMapper {
    pub fn new(kind: IdentityMapperKind) -> Self {
        match kind {
            IdentityMapperKind::None => IdentityMapper::None,
            IdentityMapperKind::Strict => IdentityMapper::Strict(HashMap::new()),
            IdentityMapperKind::Smart => IdentityMapper::Smart(HashMap::new()),
        }
    }

    pub fn kind(&self) -> IdentityMapperKind {
        match self {
            IdentityMapper::None => IdentityMapperKind::None,
            IdentityMapper::Strict(_) => IdentityMapperKind::Strict,
            IdentityMapper::Smart(_) => IdentityMapperKind::Smart,
        }
    }

    /// The instance to hand out for `entity`.
    pub fn get_instance(&mut self, entity: Entity, pk_fields: &[&str]) -> Result<EntityRef> {
        let (map, smart) = match self {
            IdentityMapper::None => return Ok(entity.into_ref()),
            IdentityMapper::Strict(map) => (map, false),
            IdentityMapper::Smart(map) => (map, true),
        };

        let key = IdentityKey::of(&entity, pk_fields)?;
        if let Some(cached) = map.get(&key) {
            trace!(kind = %key.kind, "identity map hit");
            if smart {
                let mut instance = cached.write();
                if !instance.is_modified() {
                    instance.hydrate(entity.extract());
                }
            }
            return Ok(Arc::clone(cached));
        }

        let instance = entity.into_ref();
        map.insert(key, Arc::clone(&instance));
        Ok(instance)
    }

    /// Make `instance` the cached one for its key, replacing any previous
    /// entry. Used for rows this connection just created. An empty primary
    /// key is a no-op.
    pub fn register(&mut self, instance: &EntityRef, pk_fields: &[&str]) -> Result<()> {
        match self {
            IdentityMapper::None => Ok(()),
            IdentityMapper::Strict(map) | IdentityMapper::Smart(map) => {
                if pk_fields.is_empty() {
                    return Ok(());
                }
                let key = IdentityKey::of(&instance.read(), pk_fields)?;
                map.insert(key, Arc::clone(instance));
                Ok(())
            }
        }
    }

    /// Forget `entity`. An empty primary key is a no-op.
    pub fn clear(&mut self, entity: &Entity, pk_fields: &[&str]) -> Result<()> {
        match self {
            IdentityMapper::None => Ok(()),
            IdentityMapper::Strict(map) | IdentityMapper::Smart(map) => {
                if pk_fields.is_empty() {
                    return Ok(());
                }
                map.remove(&IdentityKey::of(entity, pk_fields)?);
                Ok(())
            }
        }
    }

    /// Forget every instance.
    pub fn flush(&mut self) {
        if let IdentityMapper::Strict(map) | IdentityMapper::Smart(map) = self {
            map.clear();
        }
    }

    pub fn len(&self) -> usize {
        match self {
            IdentityMapper::None => 0,
            IdentityMapper::Strict(map) | IdentityMapper::Smart(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdentityMapper {
    fn default() -> Self {
        Self::new(IdentityMapperKind::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Status;
    use crate::Error;

    fn book(id: i64, title: &str) -> Entity {
        let mut book = Entity::with_fields(
            "Book",
            [("id", Value::Int(id)), ("title", Value::from(title))],
        );
        book.set_status(Status::EXIST);
        book
    }

    #[test]
    fn test_strict_returns_first_instance() {
        let mut mapper = IdentityMapper::new(IdentityMapperKind::Strict);
        let first = mapper.get_instance(book(1, "old"), &["id"]).unwrap();
        let second = mapper.get_instance(book(1, "new"), &["id"]).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.read().get("title").unwrap(), &Value::from("old"));
        assert_eq!(mapper.len(), 1);
    }

    #[test]
    fn test_smart_refreshes_clean_instances() {
        let mut mapper = IdentityMapper::new(IdentityMapperKind::Smart);
        let first = mapper.get_instance(book(1, "old"), &["id"]).unwrap();
        let second = mapper.get_instance(book(1, "new"), &["id"]).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.read().get("title").unwrap(), &Value::from("new"));
    }

    #[test]
    fn test_smart_keeps_local_modifications() {
        let mut mapper = IdentityMapper::new(IdentityMapperKind::Smart);
        let first = mapper.get_instance(book(1, "old"), &["id"]).unwrap();
        first.write().set("title", "edited");

        let second = mapper.get_instance(book(1, "server"), &["id"]).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.read().get("title").unwrap(), &Value::from("edited"));
        assert!(second.read().is_modified());
    }

    #[test]
    fn test_none_returns_fresh_instances() {
        let mut mapper = IdentityMapper::new(IdentityMapperKind::None);
        let first = mapper.get_instance(book(1, "t"), &["id"]).unwrap();
        let second = mapper.get_instance(book(1, "t"), &["id"]).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(*first.read(), *second.read());
        assert!(mapper.is_empty());
        // No key is computed, so an empty primary key is fine.
        assert!(mapper.get_instance(book(1, "t"), &[]).is_ok());
    }

    #[test]
    fn test_empty_primary_key_is_rejected() {
        let mut mapper = IdentityMapper::new(IdentityMapperKind::Strict);
        let err = mapper.get_instance(book(1, "t"), &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::Contract(ContractViolation::EmptyPrimaryKey(ref kind)) if kind == "Book"
        ));
    }

    #[test]
    fn test_keys_distinguish_kind_and_value_type() {
        let mut mapper = IdentityMapper::new(IdentityMapperKind::Strict);
        let a = mapper.get_instance(book(1, "t"), &["id"]).unwrap();
        let author = Entity::with_fields("Author", book(1, "t").extract());
        let b = mapper.get_instance(author, &["id"]).unwrap();
        let c = mapper
            .get_instance(Entity::with_fields("Book", [("id", Value::from("1"))]), &["id"])
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(mapper.len(), 3);
    }

    #[test]
    fn test_clear_and_flush() {
        let mut mapper = IdentityMapper::new(IdentityMapperKind::Smart);
        let first = mapper.get_instance(book(1, "t"), &["id"]).unwrap();
        mapper.get_instance(book(2, "u"), &["id"]).unwrap();

        mapper.clear(&book(1, "t"), &["id"]).unwrap();
        mapper.clear(&book(2, "u"), &[]).unwrap();
        assert_eq!(mapper.len(), 1);

        let again = mapper.get_instance(book(1, "t"), &["id"]).unwrap();
        assert!(!Arc::ptr_eq(&first, &again));

        mapper.flush();
        assert!(mapper.is_empty());
    }
}
