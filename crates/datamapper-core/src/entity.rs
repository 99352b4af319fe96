//! The `Entity` trait and shared entity handles.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crate::error::ValidationError;
use crate::metadata::EntityMetadata;
use crate::value::Value;

/// A persistent domain object with identity.
///
/// Entities are plain structs. Storage mapping lives in [`EntityMetadata`],
/// built once per type by [`Mapped::metadata`]; the core reads and writes
/// entity state only through the accessors that metadata carries.
pub trait Entity: EntityClone + Any + Send + Sync + fmt::Debug {
    /// The entity's identity value. `Value::Null` for unsaved auto-numbered entities.
    fn id(&self) -> Value;

    /// Whether this entity has never been persisted.
    ///
    /// Drives the insert-vs-update decision in `save`.
    fn is_new(&self) -> bool {
        self.id().is_null()
    }

    /// Entity-level validation run before any storage I/O.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Object-safe clone and `Any` access for entities.
///
/// Implemented automatically for every `Entity + Clone`.
pub trait EntityClone {
    fn clone_entity(&self) -> Box<dyn Entity>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Entity + Clone> EntityClone for T {
    fn clone_entity(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A concrete entity type that knows its own storage mapping.
pub trait Mapped: Entity + Clone + Default {
    /// Build this type's metadata record. Called once, at registry build time.
    fn metadata() -> EntityMetadata;
}

/// Shared, read-only handle to a materialized entity.
///
/// The object cache hands these out; callers that need to change an
/// entity clone it out with [`downcast_cloned`](EntityRefExt::downcast_cloned).
pub type EntityRef = Arc<dyn Entity>;

impl dyn Entity {
    /// Runtime type of the concrete entity behind this trait object.
    pub fn entity_type(&self) -> TypeId {
        self.as_any().type_id()
    }

    pub fn is<T: Entity>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Entity>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Entity>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// Typed helpers on shared entity handles.
pub trait EntityRefExt {
    /// Clone the entity out if it is a `T`.
    fn downcast_cloned<T: Entity + Clone>(&self) -> Option<T>;
}

impl EntityRefExt for EntityRef {
    fn downcast_cloned<T: Entity + Clone>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Note {
        id: Option<i64>,
        body: String,
    }

    impl Entity for Note {
        fn id(&self) -> Value {
            self.id.into()
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Tag {
        id: i64,
    }

    impl Entity for Tag {
        fn id(&self) -> Value {
            Value::BigInt(self.id)
        }

        fn is_new(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_is_new_defaults_to_null_id() {
        let fresh = Note::default();
        assert!(fresh.is_new());
        let saved = Note {
            id: Some(3),
            body: String::new(),
        };
        assert!(!saved.is_new());
        assert!(!Tag { id: 0 }.is_new());
    }

    #[test]
    fn test_downcasts() {
        let note: EntityRef = Arc::new(Note {
            id: Some(1),
            body: "hello".into(),
        });
        assert!(note.is::<Note>());
        assert!(!note.is::<Tag>());
        assert_eq!(note.entity_type(), TypeId::of::<Note>());
        assert_eq!(note.downcast_ref::<Note>().map(|n| n.body.as_str()), Some("hello"));
        assert!(note.downcast_cloned::<Tag>().is_none());
    }

    #[test]
    fn test_clone_entity_is_independent() {
        let original = Note {
            id: Some(1),
            body: "a".into(),
        };
        let mut copy = original.clone_entity();
        copy.downcast_mut::<Note>().unwrap().body = "b".into();
        assert_eq!(original.body, "a");
        assert_eq!(copy.downcast_ref::<Note>().unwrap().body, "b");
    }
}
