//! Backing stores
//!
//! A [`BackingStore`] holds committed rows, grouped by collection and keyed by
//! entity id. Rows are JSON documents (`serde_json::Value`) so one store can
//! hold every entity type without knowing about them.
//!
//! The persistence context reads through [`fetch`](BackingStore::fetch) and
//! [`scan`](BackingStore::scan), and writes only through
//! [`commit`](BackingStore::commit): a batch of [`Mutation`]s that is applied
//! completely or not at all. Every method has a blocking and an async form so
//! the blocking repository API never has to enter a runtime.
//!
//! # Implementations
//!
//! - [`MemoryStore`]: process-local tables
//! - [`JsonFileStore`]: tables persisted as one JSON document on disk

mod json_file;
mod memory;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::entity::EntityId;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

/// A stored entity document
pub type Row = Value;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failure reported by a backing store
#[derive(Debug, Error)]
pub enum StoreError {
    /// An insert collided with an existing row
    #[error("duplicate key {id} in collection `{collection}`")]
    DuplicateKey {
        /// Collection the insert targeted
        collection: String,
        /// Colliding id
        id: EntityId,
    },

    /// An update or delete targeted a row that does not exist
    #[error("row {id} in collection `{collection}` does not exist")]
    MissingRow {
        /// Collection the write targeted
        collection: String,
        /// Missing id
        id: EntityId,
    },

    /// The store cannot serve requests
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Row (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One pending write produced by a flush
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Create a row that must not exist yet
    Insert {
        /// Target collection
        collection: &'static str,
        /// Row key
        id: EntityId,
        /// Full row
        row: Row,
    },
    /// Overwrite an existing row in full
    Update {
        /// Target collection
        collection: &'static str,
        /// Row key
        id: EntityId,
        /// Full row
        row: Row,
    },
    /// Remove an existing row
    Delete {
        /// Target collection
        collection: &'static str,
        /// Row key
        id: EntityId,
    },
}

impl Mutation {
    /// Collection the mutation targets
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Insert { collection, .. }
            | Self::Update { collection, .. }
            | Self::Delete { collection, .. } => collection,
        }
    }

    /// Key of the row the mutation targets
    pub fn id(&self) -> EntityId {
        match self {
            Self::Insert { id, .. } | Self::Update { id, .. } | Self::Delete { id, .. } => *id,
        }
    }
}

/// Persistent row storage consumed by the persistence context
#[async_trait]
pub trait BackingStore: Send + Sync + fmt::Debug {
    /// Load one row by key
    fn fetch(&self, collection: &str, id: EntityId) -> StoreResult<Option<Row>>;

    /// Load one row by key without blocking
    async fn fetch_async(&self, collection: &str, id: EntityId) -> StoreResult<Option<Row>>;

    /// Load every row of a collection, ordered by key
    fn scan(&self, collection: &str) -> StoreResult<Vec<Row>>;

    /// Load every row of a collection without blocking
    async fn scan_async(&self, collection: &str) -> StoreResult<Vec<Row>>;

    /// Apply a batch atomically, returning the number of rows written
    fn commit(&self, batch: &[Mutation]) -> StoreResult<usize>;

    /// Apply a batch atomically without blocking
    async fn commit_async(&self, batch: &[Mutation]) -> StoreResult<usize>;

    /// Number of commits this store has been asked to perform
    fn commit_count(&self) -> u64;
}

/// Committed rows: collection name → key → row
pub(crate) type Tables = BTreeMap<String, BTreeMap<EntityId, Row>>;

/// Apply `batch` to a copy of `tables`, returning the new tables only if every
/// mutation succeeds.
pub(crate) fn stage(tables: &Tables, batch: &[Mutation]) -> StoreResult<Tables> {
    let mut touched: HashMap<&str, BTreeMap<EntityId, Row>> = HashMap::new();

    for mutation in batch {
        let collection = mutation.collection();
        let table = touched
            .entry(collection)
            .or_insert_with(|| tables.get(collection).cloned().unwrap_or_default());

        match mutation {
            Mutation::Insert { id, row, .. } => {
                if table.contains_key(id) {
                    return Err(StoreError::DuplicateKey {
                        collection: collection.to_string(),
                        id: *id,
                    });
                }
                table.insert(*id, row.clone());
            }
            Mutation::Update { id, row, .. } => match table.get_mut(id) {
                Some(existing) => *existing = row.clone(),
                None => {
                    return Err(StoreError::MissingRow {
                        collection: collection.to_string(),
                        id: *id,
                    })
                }
            },
            Mutation::Delete { id, .. } => {
                if table.remove(id).is_none() {
                    return Err(StoreError::MissingRow {
                        collection: collection.to_string(),
                        id: *id,
                    });
                }
            }
        }
    }

    let mut staged = tables.clone();
    for (collection, table) in touched {
        staged.insert(collection.to_string(), table);
    }
    Ok(staged)
}
