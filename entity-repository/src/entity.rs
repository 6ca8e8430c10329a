//! Entities and entity handles
//!
//! An [`Entity`] is any serializable record with a stable [`EntityId`]. The
//! persistence context never owns caller data by value: it tracks
//! [`EntityRef`] handles, so writes made through a tracked handle are what the
//! next flush sends to the store.
//!
//! # Identifiers
//!
//! A nil id means "not assigned yet". The context assigns a UUIDv7 (time
//! sortable, like the other entity ids in this crate) when such an entity is
//! added. Once assigned, an id must never change.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::schema::Relation;

/// Globally unique entity identifier
pub type EntityId = Uuid;

/// Generate a fresh, time-ordered entity identifier
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// A record type the persistence context can track and store.
///
/// Navigation properties filled by include directives should be marked
/// `#[serde(skip)]` so they are neither persisted nor seen by change
/// detection.
///
/// # Example
///
/// ```rust
/// use entity_repository::{Entity, EntityId};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Tag {
///     id: EntityId,
///     label: String,
/// }
///
/// impl Entity for Tag {
///     const COLLECTION: &'static str = "tags";
///
///     fn id(&self) -> EntityId {
///         self.id
///     }
///
///     fn set_id(&mut self, id: EntityId) {
///         self.id = id;
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Name of the backing collection (table) for this type
    const COLLECTION: &'static str;

    /// The entity's identifier
    fn id(&self) -> EntityId;

    /// Assign the identifier. Only called by the context for nil ids.
    fn set_id(&mut self, id: EntityId);

    /// Relations that include directives can load for this type
    fn relations() -> Vec<Relation<Self>> {
        Vec::new()
    }

    /// Hook invoked when the entity enters the `Added` state
    fn on_created(&mut self, _at: DateTime<Utc>) {}
}

/// Shared handle to a single entity instance.
///
/// Cloning the handle does not clone the entity: both handles point at the
/// same instance, which is how the context recognizes "the same object".
/// Use [`EntityRef::snapshot`] for a detached copy of the current values.
///
/// Do not hold a guard from [`read`](Self::read) or [`write`](Self::write)
/// across a repository call; the context locks the instance while flushing.
pub struct EntityRef<T> {
    inner: Arc<RwLock<T>>,
}

impl<T: Entity> EntityRef<T> {
    /// Wrap a new, untracked instance
    pub fn new(entity: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(entity)),
        }
    }

    /// The instance's current identifier
    pub fn id(&self) -> EntityId {
        self.read().id()
    }

    /// Borrow the instance for reading
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrow the instance for writing
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a mutation to the instance
    pub fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.write())
    }

    /// Copy of the current values
    pub fn snapshot(&self) -> T {
        self.read().clone()
    }

    /// Whether both handles point at the same instance
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Clone for EntityRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> From<T> for EntityRef<T> {
    fn from(entity: T) -> Self {
        Self::new(entity)
    }
}

impl<T: fmt::Debug> fmt::Debug for EntityRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_read() {
            Ok(entity) => f.debug_tuple("EntityRef").field(&*entity).finish(),
            Err(_) => f.write_str("EntityRef(<locked>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Entry;

    #[test]
    fn test_clone_shares_instance() {
        let entry = EntityRef::new(Entry::new("rust", "ownership"));
        let alias = entry.clone();
        alias.modify(|e| e.content = "borrowing".to_string());

        assert!(entry.ptr_eq(&alias));
        assert_eq!(entry.read().content, "borrowing");
    }

    #[test]
    fn test_snapshot_is_detached() {
        let entry = EntityRef::new(Entry::new("rust", "ownership"));
        let mut copy = entry.snapshot();
        copy.content = "changed".to_string();

        assert_eq!(entry.read().content, "ownership");
        assert!(!entry.ptr_eq(&EntityRef::new(copy)));
    }

    #[test]
    fn test_new_entity_ids_are_unique_and_not_nil() {
        let a = new_entity_id();
        let b = new_entity_id();
        assert_ne!(a, b);
        assert!(!a.is_nil());
    }
}
