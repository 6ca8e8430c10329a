//! Repository trait definition
//!
//! [`GenericRepository`] is the uniform CRUD/query contract for one entity
//! type. Async methods use RPITIT (Return Position Impl Trait In Traits), so
//! implementations write plain `async fn` without `async_trait`.
//!
//! # Flushing
//!
//! Every mutating method flushes the context before returning and reports the
//! number of rows the flush wrote. Changes made directly through the context
//! (or through tracked handles) between calls are flushed along with them;
//! [`save_changes`](GenericRepository::save_changes) flushes without doing
//! anything else.
//!
//! # Example
//!
//! ```rust,ignore
//! use entity_repository::prelude::*;
//!
//! let context = DbContext::in_memory();
//! let entries = EntityRepository::<Entry>::new(&context)?;
//!
//! entries.add(&EntityRef::new(Entry::new("rust", "traits")))?;
//! let rust = entries.get_list(QuerySpec::new().filter(|e| e.subject == "rust"))?;
//! ```

use std::future::Future;

use super::error::RepositoryError;
use super::query::{Query, QuerySpec};
use crate::entity::{Entity, EntityId, EntityRef};

/// Result type for repository operations
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// CRUD, bulk mutation and query contract for entities of type `T`.
///
/// `'ctx` is the lifetime of the borrowed persistence context; queries
/// returned by the repository borrow it too.
pub trait GenericRepository<'ctx, T: Entity>: Send + Sync {
    /// Insert one entity and flush
    fn add(&self, entity: &EntityRef<T>) -> RepositoryResult<usize>;

    /// Insert one entity and flush without blocking
    fn add_async(&self, entity: &EntityRef<T>)
        -> impl Future<Output = RepositoryResult<usize>> + Send;

    /// Insert several entities and flush once. An empty slice returns `0`
    /// without touching the context.
    fn add_range(&self, entities: &[EntityRef<T>]) -> RepositoryResult<usize>;

    /// Insert several entities and flush once without blocking
    fn add_range_async(
        &self,
        entities: &[EntityRef<T>],
    ) -> impl Future<Output = RepositoryResult<usize>> + Send;

    /// Mark the instance for update unless an entity with its id is already
    /// tracked locally, then flush.
    ///
    /// Only the context's tracked set is consulted, never the store: this is
    /// not an upsert against persisted state.
    fn add_or_update(&self, entity: &EntityRef<T>) -> RepositoryResult<usize>;

    /// Local-only upsert without blocking
    fn add_or_update_async(
        &self,
        entity: &EntityRef<T>,
    ) -> impl Future<Output = RepositoryResult<usize>> + Send;

    /// Lazy, tracking query over every stored `T`
    fn as_queryable(&self) -> Query<'ctx, T>;

    /// Insert a batch with a single flush
    fn bulk_add(&self, entities: &[EntityRef<T>]) -> RepositoryResult<usize>;

    /// Insert a batch with a single flush without blocking
    fn bulk_add_async(
        &self,
        entities: &[EntityRef<T>],
    ) -> impl Future<Output = RepositoryResult<usize>> + Send;

    /// Set-based delete by predicate. Not implemented.
    fn bulk_delete(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> RepositoryResult<usize>;

    /// Set-based delete of the given instances. Not implemented.
    fn bulk_delete_entities(&self, entities: &[EntityRef<T>]) -> RepositoryResult<usize>;

    /// Delete every entity whose id is in `ids` with a single flush. An empty
    /// slice returns `0` without touching the context.
    fn bulk_delete_by_id(&self, ids: &[EntityId]) -> RepositoryResult<usize>;

    /// Set-based update. Not implemented.
    fn bulk_update(&self, entities: &[EntityRef<T>]) -> RepositoryResult<usize>;

    /// Delete an instance (attaching it first if untracked) and flush
    fn delete(&self, entity: &EntityRef<T>) -> RepositoryResult<usize>;

    /// Delete an instance and flush without blocking
    fn delete_async(
        &self,
        entity: &EntityRef<T>,
    ) -> impl Future<Output = RepositoryResult<usize>> + Send;

    /// Resolve `id` and delete it. `Ok(None)` when the id does not resolve;
    /// nothing is flushed in that case.
    fn delete_by_id(&self, id: EntityId) -> RepositoryResult<Option<usize>>;

    /// Resolve `id` and delete it without blocking
    fn delete_by_id_async(
        &self,
        id: EntityId,
    ) -> impl Future<Output = RepositoryResult<Option<usize>>> + Send;

    /// Delete every match in one flush; `true` iff any row was affected
    fn delete_range(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> RepositoryResult<bool>;

    /// Delete every match in one flush without blocking
    fn delete_range_async(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> impl Future<Output = RepositoryResult<bool>> + Send;

    /// First-or-default over every entity. Not implemented.
    fn first_all_default_async(&self) -> impl Future<Output = RepositoryResult<Option<EntityRef<T>>>> + Send;

    /// Every entity. Not implemented.
    fn get_all(&self) -> RepositoryResult<Vec<EntityRef<T>>>;

    /// Lazy query: filter, then includes in order, then the tracking flag.
    /// Any ordering on `spec` is ignored; use [`get_list`](Self::get_list).
    fn get(&self, spec: QuerySpec<T>) -> Query<'ctx, T>;

    /// Resolve by id, loading the named reference relations. `Ok(None)` on a
    /// miss. With `no_tracking` the result is detached after loading.
    fn get_by_id_async(
        &self,
        id: EntityId,
        no_tracking: bool,
        includes: &[&str],
    ) -> impl Future<Output = RepositoryResult<Option<EntityRef<T>>>> + Send;

    /// Filter, include, order and materialize
    fn get_list(&self, spec: QuerySpec<T>) -> RepositoryResult<Vec<EntityRef<T>>>;

    /// Filter, include, order and materialize without blocking
    fn get_list_async(
        &self,
        spec: QuerySpec<T>,
    ) -> impl Future<Output = RepositoryResult<Vec<EntityRef<T>>>> + Send;

    /// The single match or `None`; more than one match is an error
    fn get_single_async(
        &self,
        spec: QuerySpec<T>,
    ) -> impl Future<Output = RepositoryResult<Option<EntityRef<T>>>> + Send;

    /// Attach and force every field Modified (full-row overwrite), then flush
    fn update(&self, entity: &EntityRef<T>) -> RepositoryResult<usize>;

    /// Full-row update without blocking
    fn update_async(
        &self,
        entity: &EntityRef<T>,
    ) -> impl Future<Output = RepositoryResult<usize>> + Send;

    /// Flush whatever is pending
    fn save_changes(&self) -> RepositoryResult<usize>;

    /// Flush whatever is pending without blocking
    fn save_changes_async(&self) -> impl Future<Output = RepositoryResult<usize>> + Send;
}
