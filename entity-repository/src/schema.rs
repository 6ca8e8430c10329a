//! Declared relations between entity types
//!
//! Include directives name a relation; the entity type says how that name maps
//! to another collection. Two shapes exist:
//!
//! - [`Relation::reference`]: many-to-one, resolved through a foreign key on the
//!   owner (`HasOne(..).HasForeignKey(..)`)
//! - [`Relation::collection`]: one-to-many, every row of the target collection
//!   that belongs to the owner (`WithMany(..)`)
//!
//! Related entities are loaded as detached values into the owner's
//! navigation fields; they are not tracked by the context.

use std::fmt;

use serde_json::Value;

use crate::entity::{Entity, EntityId};

/// Shape of a declared relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// A single related entity referenced by foreign key
    Reference,
    /// Zero or more related entities pointing back at the owner
    Collection,
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => write!(f, "reference"),
            Self::Collection => write!(f, "collection"),
        }
    }
}

type AssignFn<T> = Box<dyn Fn(&mut T, Vec<Value>) -> Result<(), serde_json::Error> + Send + Sync>;

/// A named relation from `T` to another entity type
pub struct Relation<T> {
    name: &'static str,
    kind: RelationKind,
    target: &'static str,
    foreign_key: Option<fn(&T) -> Option<EntityId>>,
    assign: AssignFn<T>,
}

impl<T: Entity> Relation<T> {
    /// Many-to-one relation resolved through `key` on the owner.
    ///
    /// `set` receives `None` when the key is empty or the target row is gone.
    pub fn reference<U: Entity>(
        name: &'static str,
        key: fn(&T) -> Option<EntityId>,
        set: fn(&mut T, Option<U>),
    ) -> Self {
        Self {
            name,
            kind: RelationKind::Reference,
            target: U::COLLECTION,
            foreign_key: Some(key),
            assign: Box::new(move |owner, rows| {
                let related = rows
                    .into_iter()
                    .next()
                    .map(serde_json::from_value::<U>)
                    .transpose()?;
                set(owner, related);
                Ok(())
            }),
        }
    }

    /// One-to-many relation: every `U` for which `belongs(u, owner)` holds
    pub fn collection<U: Entity>(
        name: &'static str,
        belongs: fn(&U, &T) -> bool,
        set: fn(&mut T, Vec<U>),
    ) -> Self {
        Self {
            name,
            kind: RelationKind::Collection,
            target: U::COLLECTION,
            foreign_key: None,
            assign: Box::new(move |owner, rows| {
                let mut related = Vec::new();
                for row in rows {
                    let candidate: U = serde_json::from_value(row)?;
                    if belongs(&candidate, owner) {
                        related.push(candidate);
                    }
                }
                set(owner, related);
                Ok(())
            }),
        }
    }

    /// The relation name used by include directives
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this is a reference or a collection relation
    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    /// Collection the related rows live in
    pub fn target(&self) -> &'static str {
        self.target
    }

    pub(crate) fn foreign_key(&self, owner: &T) -> Option<EntityId> {
        self.foreign_key.and_then(|key| key(owner))
    }

    /// Fill the owner's navigation field from raw target rows
    pub(crate) fn assign(&self, owner: &mut T, rows: Vec<Value>) -> Result<(), serde_json::Error> {
        (self.assign)(owner, rows)
    }
}

impl<T> fmt::Debug for Relation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("target", &self.target)
            .finish()
    }
}

/// Look up a relation of `T` by name
pub(crate) fn find_relation<T: Entity>(name: &str) -> Option<Relation<T>> {
    T::relations().into_iter().find(|relation| relation.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Entry, EntryVote, User, VoteType};

    #[test]
    fn test_find_relation_by_name() {
        let relation = find_relation::<Entry>("author").expect("author relation");
        assert_eq!(relation.kind(), RelationKind::Reference);
        assert_eq!(relation.target(), "users");

        let relation = find_relation::<Entry>("votes").expect("votes relation");
        assert_eq!(relation.kind(), RelationKind::Collection);
        assert_eq!(relation.target(), "entry_votes");

        assert!(find_relation::<Entry>("comments").is_none());
    }

    #[test]
    fn test_reference_assigns_first_row() {
        let author = User::new("ada");
        let mut entry = Entry::new("rust", "traits").written_by(author.id);
        let relation = find_relation::<Entry>("author").unwrap();

        assert_eq!(relation.foreign_key(&entry), Some(author.id));
        relation
            .assign(&mut entry, vec![serde_json::to_value(&author).unwrap()])
            .unwrap();
        assert_eq!(entry.author.as_ref().map(|u| u.name.as_str()), Some("ada"));
    }

    #[test]
    fn test_collection_filters_by_owner() {
        let mut entry = Entry::new("rust", "lifetimes");
        let other = Entry::new("go", "channels");
        let rows = vec![
            serde_json::to_value(EntryVote::new(entry.id, VoteType::Up)).unwrap(),
            serde_json::to_value(EntryVote::new(other.id, VoteType::Down)).unwrap(),
            serde_json::to_value(EntryVote::new(entry.id, VoteType::Down)).unwrap(),
        ];
        let relation = find_relation::<Entry>("votes").unwrap();
        relation.assign(&mut entry, rows).unwrap();

        assert_eq!(entry.votes.len(), 2);
        assert!(entry.votes.iter().all(|v| v.entry_id == entry.id));
    }

    #[test]
    fn test_bad_row_is_reported() {
        let mut entry = Entry::new("rust", "macros");
        let relation = find_relation::<Entry>("votes").unwrap();
        let result = relation.assign(&mut entry, vec![serde_json::json!({ "id": 7 })]);
        assert!(result.is_err());
    }
}
