//! Process-local backing store

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{stage, BackingStore, Mutation, Row, StoreResult, Tables};
use crate::entity::EntityId;

/// Backing store that keeps every table in memory.
///
/// Cheap to create, so tests and short-lived unit-of-work scopes can give
/// each context its own store, or share one store between several contexts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    commits: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed rows in a collection
    pub fn row_count(&self, collection: &str) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .map_or(0, |table| table.len())
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    fn fetch(&self, collection: &str, id: EntityId) -> StoreResult<Option<Row>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .get(collection)
            .and_then(|table| table.get(&id))
            .cloned())
    }

    async fn fetch_async(&self, collection: &str, id: EntityId) -> StoreResult<Option<Row>> {
        self.fetch(collection, id)
    }

    fn scan(&self, collection: &str) -> StoreResult<Vec<Row>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .get(collection)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn scan_async(&self, collection: &str) -> StoreResult<Vec<Row>> {
        self.scan(collection)
    }

    fn commit(&self, batch: &[Mutation]) -> StoreResult<usize> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let staged = stage(&tables, batch)?;
        *tables = staged;
        Ok(batch.len())
    }

    async fn commit_async(&self, batch: &[Mutation]) -> StoreResult<usize> {
        self.commit(batch)
    }

    fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_commit_then_fetch() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        let written = store
            .commit(&[Mutation::Insert {
                collection: "entries",
                id,
                row: json!({ "id": id }),
            }])
            .unwrap();

        assert_eq!(written, 1);
        assert!(store.fetch("entries", id).unwrap().is_some());
        assert!(store.fetch("users", id).unwrap().is_none());
        assert_eq!(store.row_count("entries"), 1);
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn test_failed_commit_changes_nothing() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        let result = store.commit(&[
            Mutation::Insert {
                collection: "entries",
                id,
                row: json!({ "id": id }),
            },
            Mutation::Delete {
                collection: "entries",
                id: Uuid::now_v7(),
            },
        ]);

        assert!(matches!(result, Err(StoreError::MissingRow { .. })));
        assert_eq!(store.row_count("entries"), 0);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_scan_async_orders_by_key() {
        let store = MemoryStore::new();
        let ids = [Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7()];
        let batch: Vec<_> = ids
            .iter()
            .rev()
            .map(|id| Mutation::Insert {
                collection: "entries",
                id: *id,
                row: json!({ "id": id }),
            })
            .collect();
        store.commit_async(&batch).await.unwrap();

        let rows = store.scan_async("entries").await.unwrap();
        let scanned: Vec<String> = rows
            .iter()
            .map(|row| row["id"].as_str().unwrap().to_string())
            .collect();
        let mut sorted = ids.to_vec();
        sorted.sort();
        let expected: Vec<String> = sorted.iter().map(|id| id.to_string()).collect();
        assert_eq!(scanned, expected);
    }
}
