//! Change tracker: the context's tracked set
//!
//! Entries are indexed by collection and id, so "is this id tracked locally"
//! is a map lookup rather than a scan.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use crate::entity::{Entity, EntityId, EntityRef};
use crate::store::{Mutation, Row};

/// State of an entity instance relative to a persistence context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Not tracked; changes are invisible to the next flush
    Detached,
    /// Tracked, matches the last known store row
    Unchanged,
    /// Pending insert
    Added,
    /// Pending full-row update
    Modified,
    /// Pending delete
    Deleted,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detached => write!(f, "detached"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Added => write!(f, "added"),
            Self::Modified => write!(f, "modified"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// Type-erased view of a tracked handle
pub(crate) trait TrackedInstance: Send + Sync {
    fn to_row(&self) -> Result<Row, serde_json::Error>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Entity> TrackedInstance for EntityRef<T> {
    fn to_row(&self) -> Result<Row, serde_json::Error> {
        serde_json::to_value(&*self.read())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) struct TrackedEntry {
    pub(crate) state: EntityState,
    pub(crate) instance: Box<dyn TrackedInstance>,
    /// Last row known to be in the store; `None` until the entity is loaded
    /// or saved.
    pub(crate) original: Option<Row>,
}

impl TrackedEntry {
    pub(crate) fn new<T: Entity>(entity: &EntityRef<T>, state: EntityState, original: Option<Row>) -> Self {
        Self {
            state,
            instance: Box::new(entity.clone()),
            original,
        }
    }

    /// The tracked handle, if it is an `EntityRef<T>`
    pub(crate) fn handle<T: Entity>(&self) -> Option<&EntityRef<T>> {
        self.instance.as_any().downcast_ref::<EntityRef<T>>()
    }

    pub(crate) fn is_instance<T: Entity>(&self, entity: &EntityRef<T>) -> bool {
        self.handle::<T>().is_some_and(|tracked| tracked.ptr_eq(entity))
    }
}

#[derive(Default)]
pub(crate) struct ChangeTracker {
    collections: HashMap<&'static str, HashMap<EntityId, TrackedEntry>>,
}

impl ChangeTracker {
    pub(crate) fn get(&self, collection: &str, id: EntityId) -> Option<&TrackedEntry> {
        self.collections.get(collection).and_then(|entries| entries.get(&id))
    }

    pub(crate) fn get_mut(&mut self, collection: &str, id: EntityId) -> Option<&mut TrackedEntry> {
        self.collections
            .get_mut(collection)
            .and_then(|entries| entries.get_mut(&id))
    }

    pub(crate) fn contains(&self, collection: &str, id: EntityId) -> bool {
        self.get(collection, id).is_some()
    }

    pub(crate) fn insert(&mut self, collection: &'static str, id: EntityId, entry: TrackedEntry) {
        self.collections.entry(collection).or_default().insert(id, entry);
    }

    pub(crate) fn remove(&mut self, collection: &str, id: EntityId) -> Option<TrackedEntry> {
        self.collections
            .get_mut(collection)
            .and_then(|entries| entries.remove(&id))
    }

    /// Every tracked handle of type `T`
    pub(crate) fn handles<T: Entity>(&self) -> Vec<EntityRef<T>> {
        self.collections
            .get(T::COLLECTION)
            .map(|entries| {
                entries
                    .values()
                    .filter_map(|entry| entry.handle::<T>().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.collections.values().map(HashMap::len).sum()
    }

    pub(crate) fn clear(&mut self) {
        self.collections.clear();
    }

    /// Build the batch the next flush must commit.
    ///
    /// Unchanged entries are compared against their original row; any
    /// difference is written as a full-row update.
    pub(crate) fn pending(&self) -> Result<Vec<Mutation>, serde_json::Error> {
        let mut batch = Vec::new();
        for (collection, entries) in &self.collections {
            for (id, entry) in entries {
                let (collection, id) = (*collection, *id);
                match entry.state {
                    EntityState::Added => batch.push(Mutation::Insert {
                        collection,
                        id,
                        row: entry.instance.to_row()?,
                    }),
                    EntityState::Modified => batch.push(Mutation::Update {
                        collection,
                        id,
                        row: entry.instance.to_row()?,
                    }),
                    EntityState::Deleted => batch.push(Mutation::Delete { collection, id }),
                    EntityState::Unchanged => {
                        let row = entry.instance.to_row()?;
                        if entry.original.as_ref().is_some_and(|original| *original != row) {
                            batch.push(Mutation::Update { collection, id, row });
                        }
                    }
                    EntityState::Detached => {}
                }
            }
        }
        Ok(batch)
    }

    /// Mark a committed batch as the new baseline
    pub(crate) fn accept(&mut self, batch: &[Mutation]) {
        for mutation in batch {
            match mutation {
                Mutation::Insert { collection, id, row } | Mutation::Update { collection, id, row } => {
                    if let Some(entry) = self.get_mut(collection, *id) {
                        entry.state = EntityState::Unchanged;
                        entry.original = Some(row.clone());
                    }
                }
                Mutation::Delete { collection, id } => {
                    self.remove(collection, *id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Entry;

    fn tracked(tracker: &mut ChangeTracker, entry: &EntityRef<Entry>, state: EntityState) {
        let original = serde_json::to_value(&*entry.read()).unwrap();
        tracker.insert(
            Entry::COLLECTION,
            entry.id(),
            TrackedEntry::new(entry, state, Some(original)),
        );
    }

    #[test]
    fn test_pending_maps_states_to_mutations() {
        let mut tracker = ChangeTracker::default();
        let added = EntityRef::new(Entry::new("a", "1"));
        let modified = EntityRef::new(Entry::new("b", "2"));
        let deleted = EntityRef::new(Entry::new("c", "3"));
        let unchanged = EntityRef::new(Entry::new("d", "4"));
        tracked(&mut tracker, &added, EntityState::Added);
        tracked(&mut tracker, &modified, EntityState::Modified);
        tracked(&mut tracker, &deleted, EntityState::Deleted);
        tracked(&mut tracker, &unchanged, EntityState::Unchanged);

        let batch = tracker.pending().unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch
            .iter()
            .any(|m| matches!(m, Mutation::Insert { id, .. } if *id == added.id())));
        assert!(batch
            .iter()
            .any(|m| matches!(m, Mutation::Update { id, .. } if *id == modified.id())));
        assert!(batch
            .iter()
            .any(|m| matches!(m, Mutation::Delete { id, .. } if *id == deleted.id())));
    }

    #[test]
    fn test_unchanged_entry_with_edits_is_detected() {
        let mut tracker = ChangeTracker::default();
        let entry = EntityRef::new(Entry::new("a", "before"));
        tracked(&mut tracker, &entry, EntityState::Unchanged);
        entry.modify(|e| e.content = "after".to_string());

        let batch = tracker.pending().unwrap();
        assert!(matches!(
            &batch[..],
            [Mutation::Update { row, .. }] if row["content"] == "after"
        ));
    }

    #[test]
    fn test_accept_resets_states() {
        let mut tracker = ChangeTracker::default();
        let added = EntityRef::new(Entry::new("a", "1"));
        let deleted = EntityRef::new(Entry::new("b", "2"));
        tracked(&mut tracker, &added, EntityState::Added);
        tracked(&mut tracker, &deleted, EntityState::Deleted);

        let batch = tracker.pending().unwrap();
        tracker.accept(&batch);

        let entry = tracker.get(Entry::COLLECTION, added.id()).unwrap();
        assert_eq!(entry.state, EntityState::Unchanged);
        assert!(entry.is_instance(&added));
        assert!(!tracker.contains(Entry::COLLECTION, deleted.id()));
        assert_eq!(tracker.len(), 1);
        assert!(tracker.pending().unwrap().is_empty());
    }

    #[test]
    fn test_handles_filters_by_type() {
        let mut tracker = ChangeTracker::default();
        let entry = EntityRef::new(Entry::new("a", "1"));
        tracked(&mut tracker, &entry, EntityState::Unchanged);

        let handles = tracker.handles::<Entry>();
        assert_eq!(handles.len(), 1);
        assert!(handles[0].ptr_eq(&entry));
    }
}
