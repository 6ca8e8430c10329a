//! Generic repository over a persistence context

use std::fmt;
use std::marker::PhantomData;

use super::error::{RepositoryError, RepositoryOperation};
use super::query::{Query, QuerySpec};
use super::traits::{GenericRepository, RepositoryResult};
use crate::context::{resolve_relations, DbContext, EntitySet, EntityState};
use crate::entity::{Entity, EntityId, EntityRef};
use crate::schema::RelationKind;

/// Repository for entities of type `T`, borrowing a [`DbContext`].
///
/// The repository holds no state of its own: every call goes through the
/// context's tracked set, and every mutating call flushes it.
pub struct EntityRepository<'ctx, T> {
    context: &'ctx DbContext,
    _entity: PhantomData<fn() -> T>,
}

impl<'ctx, T: Entity> EntityRepository<'ctx, T> {
    /// Create a repository over `context`.
    ///
    /// Fails with `InvalidArgument` when the context has been disposed.
    pub fn new(context: &'ctx DbContext) -> RepositoryResult<Self> {
        if context.is_disposed() {
            return Err(RepositoryError::invalid_argument(
                RepositoryOperation::Construct,
                "persistence context has been disposed",
            )
            .with_entity_type(T::COLLECTION));
        }
        Ok(Self {
            context,
            _entity: PhantomData,
        })
    }

    /// The borrowed context
    pub fn context(&self) -> &'ctx DbContext {
        self.context
    }

    /// Empty query spec for this repository's reads, starting from the
    /// context's configured tracking default
    /// ([`ContextConfig::default_no_tracking`](crate::config::ContextConfig)).
    ///
    /// `QuerySpec::new()` always starts with tracking off.
    pub fn spec(&self) -> QuerySpec<T> {
        self.context.query_spec()
    }

    fn set(&self) -> EntitySet<'ctx, T> {
        self.context.set::<T>()
    }

    fn flush(&self, operation: RepositoryOperation) -> RepositoryResult<usize> {
        self.context
            .save_changes()
            .map_err(|e| e.with_operation(operation))
    }

    async fn flush_async(&self, operation: RepositoryOperation) -> RepositoryResult<usize> {
        self.context
            .save_changes_async()
            .await
            .map_err(|e| e.with_operation(operation))
    }

    fn insert_batch(
        &self,
        entities: &[EntityRef<T>],
        operation: RepositoryOperation,
    ) -> RepositoryResult<usize> {
        if entities.is_empty() {
            tracing::debug!(collection = T::COLLECTION, %operation, "Empty batch, skipping flush");
            return Ok(0);
        }
        self.set()
            .add_range(entities)
            .map_err(|e| e.with_operation(operation))?;
        self.flush(operation)
    }

    async fn insert_batch_async(
        &self,
        entities: &[EntityRef<T>],
        operation: RepositoryOperation,
    ) -> RepositoryResult<usize> {
        if entities.is_empty() {
            tracing::debug!(collection = T::COLLECTION, %operation, "Empty batch, skipping flush");
            return Ok(0);
        }
        self.set()
            .add_range_async(entities)
            .await
            .map_err(|e| e.with_operation(operation))?;
        self.flush_async(operation).await
    }

    /// Mark the instance for update unless its id is already tracked
    fn mark_upsert(&self, entity: &EntityRef<T>) -> RepositoryResult<()> {
        let set = self.set();
        if set.is_tracked(entity.id()) {
            tracing::debug!(collection = T::COLLECTION, id = %entity.id(), "Already tracked, relying on change detection");
            return Ok(());
        }
        set.update(entity)
            .map_err(|e| e.with_operation(RepositoryOperation::AddOrUpdate))
    }

    fn tracked_matches(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Query<'ctx, T> {
        Query::new(self.context, QuerySpec::new().tracking().filter(predicate))
    }

    fn not_supported<R>(&self, operation: RepositoryOperation) -> RepositoryResult<R> {
        Err(RepositoryError::not_supported(operation, T::COLLECTION))
    }
}

impl<T> Clone for EntityRepository<'_, T> {
    fn clone(&self) -> Self {
        Self {
            context: self.context,
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> fmt::Debug for EntityRepository<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRepository")
            .field("collection", &T::COLLECTION)
            .field("context", &self.context)
            .finish()
    }
}

impl<'ctx, T: Entity> GenericRepository<'ctx, T> for EntityRepository<'ctx, T> {
    fn add(&self, entity: &EntityRef<T>) -> RepositoryResult<usize> {
        let operation = RepositoryOperation::Add;
        self.set()
            .add(entity)
            .map_err(|e| e.with_operation(operation))?;
        self.flush(operation)
    }

    async fn add_async(&self, entity: &EntityRef<T>) -> RepositoryResult<usize> {
        let operation = RepositoryOperation::Add;
        self.set()
            .add(entity)
            .map_err(|e| e.with_operation(operation))?;
        self.flush_async(operation).await
    }

    fn add_range(&self, entities: &[EntityRef<T>]) -> RepositoryResult<usize> {
        self.insert_batch(entities, RepositoryOperation::Add)
    }

    async fn add_range_async(&self, entities: &[EntityRef<T>]) -> RepositoryResult<usize> {
        self.insert_batch_async(entities, RepositoryOperation::Add)
            .await
    }

    fn add_or_update(&self, entity: &EntityRef<T>) -> RepositoryResult<usize> {
        self.mark_upsert(entity)?;
        self.flush(RepositoryOperation::AddOrUpdate)
    }

    async fn add_or_update_async(&self, entity: &EntityRef<T>) -> RepositoryResult<usize> {
        self.mark_upsert(entity)?;
        self.flush_async(RepositoryOperation::AddOrUpdate).await
    }

    fn as_queryable(&self) -> Query<'ctx, T> {
        self.set().query()
    }

    fn bulk_add(&self, entities: &[EntityRef<T>]) -> RepositoryResult<usize> {
        self.insert_batch(entities, RepositoryOperation::BulkAdd)
    }

    async fn bulk_add_async(&self, entities: &[EntityRef<T>]) -> RepositoryResult<usize> {
        self.insert_batch_async(entities, RepositoryOperation::BulkAdd)
            .await
    }

    // TODO: pick set-based semantics (one store-level delete/update per call)
    // before implementing the three bulk operations below.
    fn bulk_delete(
        &self,
        _predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> RepositoryResult<usize> {
        self.not_supported(RepositoryOperation::BulkDelete)
    }

    fn bulk_delete_entities(&self, _entities: &[EntityRef<T>]) -> RepositoryResult<usize> {
        self.not_supported(RepositoryOperation::BulkDelete)
    }

    fn bulk_delete_by_id(&self, ids: &[EntityId]) -> RepositoryResult<usize> {
        let operation = RepositoryOperation::BulkDeleteById;
        if ids.is_empty() {
            tracing::debug!(collection = T::COLLECTION, %operation, "Empty batch, skipping flush");
            return Ok(0);
        }

        let set = self.set();
        for id in ids {
            let found = set.find(*id).map_err(|e| e.with_operation(operation))?;
            match found {
                Some(entity) => set.remove(&entity).map_err(|e| e.with_operation(operation))?,
                None => tracing::debug!(collection = T::COLLECTION, %id, "Id did not resolve, skipping"),
            }
        }
        self.flush(operation)
    }

    fn bulk_update(&self, _entities: &[EntityRef<T>]) -> RepositoryResult<usize> {
        self.not_supported(RepositoryOperation::BulkUpdate)
    }

    fn delete(&self, entity: &EntityRef<T>) -> RepositoryResult<usize> {
        let operation = RepositoryOperation::Delete;
        self.set()
            .remove(entity)
            .map_err(|e| e.with_operation(operation))?;
        self.flush(operation)
    }

    async fn delete_async(&self, entity: &EntityRef<T>) -> RepositoryResult<usize> {
        let operation = RepositoryOperation::Delete;
        self.set()
            .remove(entity)
            .map_err(|e| e.with_operation(operation))?;
        self.flush_async(operation).await
    }

    fn delete_by_id(&self, id: EntityId) -> RepositoryResult<Option<usize>> {
        let found = self
            .set()
            .find(id)
            .map_err(|e| e.with_operation(RepositoryOperation::Delete))?;
        match found {
            Some(entity) => self.delete(&entity).map(Some),
            None => {
                tracing::debug!(collection = T::COLLECTION, %id, "Delete target not found");
                Ok(None)
            }
        }
    }

    async fn delete_by_id_async(&self, id: EntityId) -> RepositoryResult<Option<usize>> {
        let found = self
            .set()
            .find_async(id)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::Delete))?;
        match found {
            Some(entity) => self.delete_async(&entity).await.map(Some),
            None => {
                tracing::debug!(collection = T::COLLECTION, %id, "Delete target not found");
                Ok(None)
            }
        }
    }

    fn delete_range(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> RepositoryResult<bool> {
        let operation = RepositoryOperation::DeleteRange;
        let matches = self
            .tracked_matches(predicate)
            .to_list()
            .map_err(|e| e.with_operation(operation))?;
        self.set()
            .remove_range(&matches)
            .map_err(|e| e.with_operation(operation))?;
        Ok(self.flush(operation)? > 0)
    }

    async fn delete_range_async(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> RepositoryResult<bool> {
        let operation = RepositoryOperation::DeleteRange;
        let matches = self
            .tracked_matches(predicate)
            .to_list_async()
            .await
            .map_err(|e| e.with_operation(operation))?;
        self.set()
            .remove_range(&matches)
            .map_err(|e| e.with_operation(operation))?;
        Ok(self.flush_async(operation).await? > 0)
    }

    async fn first_all_default_async(&self) -> RepositoryResult<Option<EntityRef<T>>> {
        self.not_supported(RepositoryOperation::FirstAllDefault)
    }

    fn get_all(&self) -> RepositoryResult<Vec<EntityRef<T>>> {
        self.not_supported(RepositoryOperation::GetAll)
    }

    fn get(&self, spec: QuerySpec<T>) -> Query<'ctx, T> {
        Query::new(self.context, spec.unordered())
    }

    async fn get_by_id_async(
        &self,
        id: EntityId,
        no_tracking: bool,
        includes: &[&str],
    ) -> RepositoryResult<Option<EntityRef<T>>> {
        let operation = RepositoryOperation::GetById;
        let relations = resolve_relations::<T, _>(includes, operation)?;
        if let Some(relation) = relations.iter().find(|r| r.kind() != RelationKind::Reference) {
            return Err(RepositoryError::invalid_argument(
                operation,
                format!(
                    "only reference relations can be included here, `{}` is a {} relation",
                    relation.name(),
                    relation.kind()
                ),
            )
            .with_entity_type(T::COLLECTION));
        }

        let Some(entity) = self.set().find_async(id).await? else {
            tracing::debug!(collection = T::COLLECTION, %id, "Entity not found");
            return Ok(None);
        };

        if no_tracking {
            self.context
                .entry(&entity)
                .set_state(EntityState::Detached)
                .map_err(|e| e.with_operation(operation))?;
        }
        self.context
            .load_relations_async(std::slice::from_ref(&entity), &relations)
            .await
            .map_err(|e| e.with_operation(operation))?;
        Ok(Some(entity))
    }

    fn get_list(&self, spec: QuerySpec<T>) -> RepositoryResult<Vec<EntityRef<T>>> {
        Query::new(self.context, spec)
            .to_list()
            .map_err(|e| e.with_operation(RepositoryOperation::GetList))
    }

    async fn get_list_async(&self, spec: QuerySpec<T>) -> RepositoryResult<Vec<EntityRef<T>>> {
        Query::new(self.context, spec)
            .to_list_async()
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::GetList))
    }

    async fn get_single_async(&self, spec: QuerySpec<T>) -> RepositoryResult<Option<EntityRef<T>>> {
        Query::new(self.context, spec.unordered())
            .single_async()
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::GetSingle))
    }

    fn update(&self, entity: &EntityRef<T>) -> RepositoryResult<usize> {
        let operation = RepositoryOperation::Update;
        self.set()
            .update(entity)
            .map_err(|e| e.with_operation(operation))?;
        self.flush(operation)
    }

    async fn update_async(&self, entity: &EntityRef<T>) -> RepositoryResult<usize> {
        let operation = RepositoryOperation::Update;
        self.set()
            .update(entity)
            .map_err(|e| e.with_operation(operation))?;
        self.flush_async(operation).await
    }

    fn save_changes(&self) -> RepositoryResult<usize> {
        self.context.save_changes()
    }

    async fn save_changes_async(&self) -> RepositoryResult<usize> {
        self.context.save_changes_async().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ContextConfig;
    use crate::repository::RepositoryErrorKind;
    use crate::store::{BackingStore, MemoryStore};
    use crate::testing::{seeded_context, Entry, User};

    fn repo(context: &DbContext) -> EntityRepository<'_, Entry> {
        EntityRepository::new(context).unwrap()
    }

    #[test]
    fn test_new_rejects_disposed_context() {
        let context = DbContext::in_memory();
        context.dispose();

        let err = EntityRepository::<Entry>::new(&context).unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::InvalidArgument);
        assert_eq!(err.operation, RepositoryOperation::Construct);
    }

    #[tokio::test]
    async fn test_add_then_get_by_id_round_trips() {
        let store: Arc<dyn BackingStore> = Arc::new(MemoryStore::new());
        let writer = DbContext::new(Arc::clone(&store));
        let entry = EntityRef::new(Entry::new("rust", "ownership"));
        assert_eq!(repo(&writer).add_async(&entry).await.unwrap(), 1);

        let reader = DbContext::new(store);
        let fetched = repo(&reader)
            .get_by_id_async(entry.id(), true, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.snapshot(), entry.snapshot());
        assert_eq!(reader.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_batches_do_not_flush() {
        let context = DbContext::in_memory();
        let entries = repo(&context);

        assert_eq!(entries.add_range(&[]).unwrap(), 0);
        assert_eq!(entries.add_range_async(&[]).await.unwrap(), 0);
        assert_eq!(entries.bulk_add(&[]).unwrap(), 0);
        assert_eq!(entries.bulk_add_async(&[]).await.unwrap(), 0);
        assert_eq!(entries.bulk_delete_by_id(&[]).unwrap(), 0);
        assert_eq!(context.flush_count(), 0);
        assert_eq!(context.store().commit_count(), 0);
    }

    #[test]
    fn test_bulk_add_flushes_once() {
        let context = DbContext::in_memory();
        let batch: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|subject| EntityRef::new(Entry::new(subject, "x")))
            .collect();

        assert_eq!(repo(&context).bulk_add(&batch).unwrap(), 3);
        assert_eq!(context.flush_count(), 1);
        assert_eq!(context.store().scan(Entry::COLLECTION).unwrap().len(), 3);
    }

    #[test]
    fn test_add_or_update_untracked_marks_modified() {
        let context = seeded_context(&[("rust", "stored")]);
        let stored = context.set::<Entry>().query().as_no_tracking().to_list().unwrap();
        let detached = EntityRef::new(stored[0].snapshot());
        detached.modify(|e| e.content = "from caller".to_string());

        assert_eq!(repo(&context).add_or_update(&detached).unwrap(), 1);
        let row = context.store().fetch(Entry::COLLECTION, detached.id()).unwrap().unwrap();
        assert_eq!(row["content"], "from caller");
    }

    #[test]
    fn test_add_or_update_tracked_flushes_tracked_instance() {
        let context = seeded_context(&[("rust", "stored")]);
        let tracked = context.set::<Entry>().query().to_list().unwrap().remove(0);
        tracked.modify(|e| e.content = "tracked edit".to_string());

        let caller = EntityRef::new(tracked.snapshot());
        caller.modify(|e| e.content = "caller edit".to_string());

        assert_eq!(repo(&context).add_or_update(&caller).unwrap(), 1);
        let row = context.store().fetch(Entry::COLLECTION, tracked.id()).unwrap().unwrap();
        assert_eq!(row["content"], "tracked edit");
        assert_eq!(context.entry(&caller).state(), EntityState::Detached);
    }

    #[test]
    fn test_add_or_update_new_entity_inserts() {
        let context = DbContext::in_memory();
        let entry = EntityRef::new(Entry::new("rust", "fresh").without_id());

        assert_eq!(repo(&context).add_or_update(&entry).unwrap(), 1);
        assert!(!entry.id().is_nil());
        assert!(context.store().fetch(Entry::COLLECTION, entry.id()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_by_id_miss_yields_none() {
        let context = seeded_context(&[("rust", "x")]);
        let entries = repo(&context);

        assert_eq!(entries.delete_by_id(EntityId::now_v7()).unwrap(), None);
        assert_eq!(entries.delete_by_id_async(EntityId::now_v7()).await.unwrap(), None);
        assert_eq!(context.flush_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_by_id_removes_row() {
        let context = seeded_context(&[("rust", "x"), ("go", "y")]);
        let ids: Vec<EntityId> = context
            .store()
            .scan(Entry::COLLECTION)
            .unwrap()
            .iter()
            .map(|row| serde_json::from_value::<Entry>(row.clone()).unwrap().id)
            .collect();

        assert_eq!(repo(&context).delete_by_id_async(ids[0]).await.unwrap(), Some(1));
        assert!(context.store().fetch(Entry::COLLECTION, ids[0]).unwrap().is_none());
        assert!(context.store().fetch(Entry::COLLECTION, ids[1]).unwrap().is_some());
    }

    #[test]
    fn test_delete_attaches_detached_instance() {
        let context = seeded_context(&[("rust", "x")]);
        let stored = context.set::<Entry>().query().as_no_tracking().to_list().unwrap();
        assert_eq!(context.entry(&stored[0]).state(), EntityState::Detached);

        assert_eq!(repo(&context).delete(&stored[0]).unwrap(), 1);
        assert!(context.store().scan(Entry::COLLECTION).unwrap().is_empty());
        assert_eq!(context.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_range_async_removes_only_matches() {
        let context = seeded_context(&[("rust", "a"), ("go", "b"), ("rust", "c")]);
        let entries = repo(&context);

        assert!(entries.delete_range_async(|e| e.subject == "rust").await.unwrap());
        let remaining = entries.get_list(QuerySpec::<Entry>::new()).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].read().subject, "go");

        assert!(!entries.delete_range_async(|e| e.subject == "rust").await.unwrap());
        assert!(!entries.delete_range(|e| e.subject == "cobol").unwrap());
    }

    #[test]
    fn test_bulk_delete_by_id_skips_misses() {
        let context = seeded_context(&[("rust", "a"), ("go", "b")]);
        let ids: Vec<EntityId> = repo(&context)
            .get_list(QuerySpec::<Entry>::new())
            .unwrap()
            .iter()
            .map(EntityRef::id)
            .chain([EntityId::now_v7()])
            .collect();

        assert_eq!(repo(&context).bulk_delete_by_id(&ids).unwrap(), 2);
        assert_eq!(context.flush_count(), 1);
        assert!(context.store().scan(Entry::COLLECTION).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_single_async_zero_one_many() {
        let context = seeded_context(&[("rust", "a"), ("go", "b"), ("go", "c")]);
        let entries = repo(&context);

        let none = entries
            .get_single_async(QuerySpec::<Entry>::new().filter(|e| e.subject == "cobol"))
            .await
            .unwrap();
        assert!(none.is_none());

        let one = entries
            .get_single_async(QuerySpec::<Entry>::new().filter(|e| e.subject == "rust"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(one.read().content, "a");

        let err = entries
            .get_single_async(QuerySpec::<Entry>::new().filter(|e| e.subject == "go"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::MultipleResultsFound);
        assert_eq!(err.operation, RepositoryOperation::GetSingle);
    }

    #[tokio::test]
    async fn test_get_list_respects_order() {
        let context = seeded_context(&[("b", "2"), ("d", "4"), ("a", "1"), ("c", "3")]);
        let entries = repo(&context);
        let spec = QuerySpec::<Entry>::new()
            .filter(|e| e.subject != "d")
            .order_by(|a, b| a.subject.cmp(&b.subject));

        let listed = entries.get_list(spec.clone()).unwrap();
        let subjects: Vec<String> = listed.iter().map(|e| e.read().subject.clone()).collect();
        assert_eq!(subjects, ["a", "b", "c"]);
        assert!(listed
            .windows(2)
            .all(|pair| pair[0].read().subject <= pair[1].read().subject));

        let listed_async = entries.get_list_async(spec).await.unwrap();
        assert_eq!(listed_async.len(), 3);
    }

    #[test]
    fn test_get_no_tracking_scenario() {
        let context = seeded_context(&[("a", "x"), ("b", "y")]);
        let entries = repo(&context);

        let query = entries.get(QuerySpec::<Entry>::new().filter(|e| e.content == "x").no_tracking(true));
        let results = query.to_list().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].read().subject, "a");

        results[0].modify(|e| e.content = "mutated".to_string());
        assert_eq!(entries.save_changes().unwrap(), 0);
        let row = context.store().fetch(Entry::COLLECTION, results[0].id()).unwrap().unwrap();
        assert_eq!(row["content"], "x");
    }

    #[tokio::test]
    async fn test_not_supported_operations() {
        let context = seeded_context(&[("rust", "x")]);
        let entries = repo(&context);
        let existing = entries.get_list(QuerySpec::<Entry>::new()).unwrap();

        let errors = [
            entries.bulk_delete(|_| true).unwrap_err(),
            entries.bulk_delete_entities(&existing).unwrap_err(),
            entries.bulk_delete_entities(&[]).unwrap_err(),
            entries.bulk_update(&existing).unwrap_err(),
            entries.get_all().unwrap_err(),
            entries.first_all_default_async().await.unwrap_err(),
        ];
        assert!(errors
            .iter()
            .all(|e| e.kind == RepositoryErrorKind::NotSupported));
        assert_eq!(context.store().scan(Entry::COLLECTION).unwrap().len(), 1);
    }

    #[test]
    fn test_update_overwrites_full_row() {
        let context = seeded_context(&[("rust", "x")]);
        let stored = context.set::<Entry>().query().as_no_tracking().to_list().unwrap();
        let replacement = EntityRef::new(stored[0].snapshot());
        replacement.modify(|e| {
            e.subject = "rust 2024".to_string();
            e.content = "y".to_string();
        });

        assert_eq!(repo(&context).update(&replacement).unwrap(), 1);
        let row = context.store().fetch(Entry::COLLECTION, replacement.id()).unwrap().unwrap();
        assert_eq!(row["subject"], "rust 2024");
        assert_eq!(row["content"], "y");
    }

    #[tokio::test]
    async fn test_update_of_deleted_row_is_persistence_failure() {
        let context = DbContext::in_memory();
        let ghost = EntityRef::new(Entry::new("rust", "never stored"));

        let err = repo(&context).update_async(&ghost).await.unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ConcurrencyConflict);
        assert_eq!(err.operation, RepositoryOperation::Update);
        assert!(err.is_persistence_failure());
    }

    #[test]
    fn test_duplicate_key_fails_whole_batch() {
        let context = seeded_context(&[("rust", "x")]);
        let existing = context.set::<Entry>().query().as_no_tracking().to_list().unwrap();

        let other = DbContext::new(Arc::clone(context.store()));
        let batch = vec![
            EntityRef::new(Entry::new("go", "y")),
            EntityRef::new(existing[0].snapshot()),
        ];
        let err = repo(&other).bulk_add(&batch).unwrap_err();

        assert_eq!(err.kind, RepositoryErrorKind::ConstraintViolation);
        assert_eq!(err.operation, RepositoryOperation::BulkAdd);
        assert_eq!(context.store().scan(Entry::COLLECTION).unwrap().len(), 1);
    }

    #[test]
    fn test_spec_follows_configured_tracking_default() {
        let seeded = seeded_context(&[("rust", "x")]);
        let config = ContextConfig {
            default_no_tracking: false,
        };
        let tracking = DbContext::with_config(Arc::clone(seeded.store()), config);
        let found = repo(&tracking).get_list(repo(&tracking).spec()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(tracking.entry(&found[0]).state(), EntityState::Unchanged);

        let untracked = DbContext::new(Arc::clone(seeded.store()));
        repo(&untracked).get_list(repo(&untracked).spec()).unwrap();
        assert_eq!(untracked.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_add_range_leaves_nothing_pending() {
        let context = DbContext::in_memory();
        let entry = EntityRef::new(Entry::new("rust", "x"));
        let copy = EntityRef::new(entry.snapshot());

        let err = repo(&context).add_range_async(&[entry, copy]).await.unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::InvalidArgument);
        assert_eq!(err.operation, RepositoryOperation::Add);
        assert_eq!(context.flush_count(), 0);

        let unrelated = EntityRef::new(User::new("ada"));
        context.set::<User>().add(&unrelated).unwrap();
        assert_eq!(context.save_changes().unwrap(), 1);
        assert!(context.store().scan(Entry::COLLECTION).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_by_id_async_loads_reference() {
        let context = DbContext::in_memory();
        let author = EntityRef::new(User::new("ada"));
        let entry = EntityRef::new(Entry::new("rust", "x").written_by(author.id()));
        context.set::<User>().add(&author).unwrap();
        context.set::<Entry>().add(&entry).unwrap();
        context.save_changes().unwrap();

        let reader = DbContext::new(Arc::clone(context.store()));
        let fetched = repo(&reader)
            .get_by_id_async(entry.id(), false, &["author"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.read().author.as_ref().map(|u| u.name.as_str()), Some("ada"));
        assert_eq!(reader.entry(&fetched).state(), EntityState::Unchanged);

        let err = repo(&reader)
            .get_by_id_async(entry.id(), true, &["votes"])
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_get_by_id_async_miss_is_none() {
        let context = DbContext::in_memory();
        let found = repo(&context)
            .get_by_id_async(EntityId::now_v7(), true, &[])
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_as_queryable_is_unfiltered() {
        let context = seeded_context(&[("rust", "x"), ("go", "y")]);
        let query = repo(&context).as_queryable();
        assert!(!query.spec().has_filter());
        assert!(!query.spec().is_no_tracking());
        assert_eq!(query.count().unwrap(), 2);
    }
}
