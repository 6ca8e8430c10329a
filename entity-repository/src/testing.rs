//! Fixture entities shared by unit tests

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::DbContext;
use crate::entity::{new_entity_id, Entity, EntityId, EntityRef};
use crate::schema::Relation;
use crate::store::{BackingStore, MemoryStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct User {
    pub id: EntityId,
    pub name: String,
}

impl User {
    pub fn new(name: &str) -> Self {
        Self {
            id: new_entity_id(),
            name: name.to_string(),
        }
    }
}

impl Entity for User {
    const COLLECTION: &'static str = "users";

    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Entry {
    pub id: EntityId,
    pub subject: String,
    pub content: String,
    pub created_by_id: Option<EntityId>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub author: Option<User>,
    #[serde(skip)]
    pub votes: Vec<EntryVote>,
}

impl Entry {
    pub fn new(subject: &str, content: &str) -> Self {
        Self {
            id: new_entity_id(),
            subject: subject.to_string(),
            content: content.to_string(),
            created_by_id: None,
            created_at: None,
            author: None,
            votes: Vec::new(),
        }
    }

    pub fn written_by(mut self, user: EntityId) -> Self {
        self.created_by_id = Some(user);
        self
    }

    pub fn without_id(mut self) -> Self {
        self.id = EntityId::nil();
        self
    }
}

impl Entity for Entry {
    const COLLECTION: &'static str = "entries";

    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn relations() -> Vec<Relation<Self>> {
        vec![
            Relation::reference::<User>("author", |e| e.created_by_id, |e, user| e.author = user),
            Relation::collection::<EntryVote>(
                "votes",
                |vote, entry| vote.entry_id == entry.id,
                |e, votes| e.votes = votes,
            ),
        ]
    }

    fn on_created(&mut self, at: DateTime<Utc>) {
        self.created_at.get_or_insert(at);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum VoteType {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct EntryVote {
    pub id: EntityId,
    pub entry_id: EntityId,
    pub vote_type: VoteType,
    #[serde(skip)]
    pub entry: Option<Entry>,
}

impl EntryVote {
    pub fn new(entry_id: EntityId, vote_type: VoteType) -> Self {
        Self {
            id: new_entity_id(),
            entry_id,
            vote_type,
            entry: None,
        }
    }
}

impl Entity for EntryVote {
    const COLLECTION: &'static str = "entry_votes";

    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn relations() -> Vec<Relation<Self>> {
        vec![Relation::reference::<Entry>(
            "entry",
            |v| Some(v.entry_id),
            |v, entry| v.entry = entry,
        )]
    }
}

/// A context over a store holding one `Entry` per `(subject, content)` pair.
/// Nothing is tracked by the returned context.
pub(crate) fn seeded_context(entries: &[(&str, &str)]) -> DbContext {
    let store: Arc<dyn BackingStore> = Arc::new(MemoryStore::new());
    let seeder = DbContext::new(Arc::clone(&store));
    let handles: Vec<_> = entries
        .iter()
        .map(|(subject, content)| EntityRef::new(Entry::new(subject, content)))
        .collect();
    seeder.set::<Entry>().add_range(&handles).unwrap();
    seeder.save_changes().unwrap();
    DbContext::new(store)
}
