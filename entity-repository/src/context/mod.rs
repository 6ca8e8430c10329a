//! Persistence context: change tracking and the unit-of-work boundary
//!
//! A [`DbContext`] tracks entity handles in memory and writes every pending
//! change to its [`BackingStore`] in one atomic commit when
//! [`save_changes`](DbContext::save_changes) (or its async twin) is called.
//!
//! # Tracking model
//!
//! Each tracked instance has an [`EntityState`]. A flush turns `Added` into an
//! insert, `Modified` into a full-row update, `Deleted` into a delete, and
//! compares `Unchanged` instances with the row they were loaded from so plain
//! field edits on tracked handles are saved too. After a successful flush
//! every written entry is `Unchanged` and deleted entries are detached. A
//! failed flush leaves both the store and every entry state as they were.
//!
//! Only one instance per id can be tracked. Queries that track return the
//! already-tracked handle for an id instead of a second copy.
//!
//! # Concurrency
//!
//! The context is a unit of work for a single caller. It is `Send + Sync` so it
//! can be borrowed across `.await` points, but concurrent mutation from several
//! tasks needs external coordination.

mod tracker;

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use futures::future::try_join_all;

use crate::config::{Config, ContextConfig};
use crate::entity::{new_entity_id, Entity, EntityId, EntityRef};
use crate::error::Result;
use crate::repository::{Query, QuerySpec, RepositoryError, RepositoryOperation, RepositoryResult};
use crate::schema::{find_relation, Relation, RelationKind};
use crate::store::{BackingStore, MemoryStore, Mutation, Row};

pub use tracker::EntityState;
pub(crate) use tracker::{ChangeTracker, TrackedEntry};

/// Change-tracking unit of work over a backing store
pub struct DbContext {
    store: Arc<dyn BackingStore>,
    tracker: Mutex<ChangeTracker>,
    config: ContextConfig,
    disposed: AtomicBool,
    flushes: AtomicU64,
}

impl DbContext {
    /// Create a context over `store` with default settings
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self::with_config(store, ContextConfig::default())
    }

    /// Create a context over `store` with explicit settings
    pub fn with_config(store: Arc<dyn BackingStore>, config: ContextConfig) -> Self {
        Self {
            store,
            tracker: Mutex::new(ChangeTracker::default()),
            config,
            disposed: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
        }
    }

    /// Create a context over a fresh [`MemoryStore`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Open the configured store and create a context over it
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = config.store.open()?;
        Ok(Self::with_config(store, config.context.clone()))
    }

    /// The backing store this context flushes to
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Context settings
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Typed view over one collection
    pub fn set<T: Entity>(&self) -> EntitySet<'_, T> {
        EntitySet {
            context: self,
            _entity: PhantomData,
        }
    }

    /// Tracking information for one instance
    pub fn entry<T: Entity>(&self, entity: &EntityRef<T>) -> EntityEntry<'_, T> {
        EntityEntry {
            context: self,
            entity: entity.clone(),
        }
    }

    /// Empty query spec carrying the configured default tracking flag
    pub fn query_spec<T: Entity>(&self) -> QuerySpec<T> {
        QuerySpec::new().no_tracking(self.config.default_no_tracking)
    }

    /// Whether the next flush would write anything
    pub fn has_changes(&self) -> RepositoryResult<bool> {
        Ok(!self.pending(RepositoryOperation::SaveChanges)?.is_empty())
    }

    /// Number of tracked instances across all collections
    pub fn tracked_count(&self) -> usize {
        self.tracker().len()
    }

    /// Number of flushes requested on this context, including ones that had
    /// nothing to write
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Detach everything and refuse further use
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.tracker().clear();
            tracing::debug!("Persistence context disposed");
        }
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Write every pending change in one commit, returning the rows affected
    pub fn save_changes(&self) -> RepositoryResult<usize> {
        let operation = RepositoryOperation::SaveChanges;
        self.ensure_open(operation)?;
        self.flushes.fetch_add(1, Ordering::Relaxed);

        let batch = self.pending(operation)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        match self.store.commit(&batch) {
            Ok(affected) => {
                self.accept(&batch, affected, started);
                Ok(affected)
            }
            Err(e) => {
                tracing::warn!(mutations = batch.len(), error = %e, "Flush failed");
                Err(RepositoryError::from_store(operation, e))
            }
        }
    }

    /// Write every pending change in one commit without blocking
    pub async fn save_changes_async(&self) -> RepositoryResult<usize> {
        let operation = RepositoryOperation::SaveChanges;
        self.ensure_open(operation)?;
        self.flushes.fetch_add(1, Ordering::Relaxed);

        let batch = self.pending(operation)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        match self.store.commit_async(&batch).await {
            Ok(affected) => {
                self.accept(&batch, affected, started);
                Ok(affected)
            }
            Err(e) => {
                tracing::warn!(mutations = batch.len(), error = %e, "Flush failed");
                Err(RepositoryError::from_store(operation, e))
            }
        }
    }

    pub(crate) fn ensure_open(&self, operation: RepositoryOperation) -> RepositoryResult<()> {
        if self.is_disposed() {
            return Err(RepositoryError::invalid_argument(
                operation,
                "persistence context has been disposed",
            ));
        }
        Ok(())
    }

    fn tracker(&self) -> MutexGuard<'_, ChangeTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self, operation: RepositoryOperation) -> RepositoryResult<Vec<Mutation>> {
        self.tracker()
            .pending()
            .map_err(|e| RepositoryError::serialization(operation, e.to_string()))
    }

    fn accept(&self, batch: &[Mutation], affected: usize, started: Instant) {
        self.tracker().accept(batch);
        let mut collections: Vec<&str> = batch.iter().map(Mutation::collection).collect();
        collections.sort_unstable();
        collections.dedup();
        tracing::debug!(
            rows = affected,
            collections = ?collections,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Changes flushed"
        );
    }

    /// Move `entity` to the state chosen by `next`, given its current state
    /// (`None` when untracked).
    ///
    /// An unassigned id gets a fresh one and always lands in `Added`, unless
    /// the target state is `Deleted` or `Detached`, which is a no-op for an
    /// entity the store has never seen.
    fn transition<T: Entity>(
        &self,
        entity: &EntityRef<T>,
        operation: RepositoryOperation,
        next: impl FnOnce(Option<EntityState>) -> EntityState,
    ) -> RepositoryResult<EntityState> {
        self.ensure_open(operation)?;
        let mut tracker = self.tracker();

        let id = entity.id();
        if id.is_nil() {
            if matches!(next(None), EntityState::Deleted | EntityState::Detached) {
                return Ok(EntityState::Detached);
            }
            let id = new_entity_id();
            entity.modify(|e| {
                e.set_id(id);
                e.on_created(Utc::now());
            });
            tracker.insert(T::COLLECTION, id, TrackedEntry::new(entity, EntityState::Added, None));
            tracing::debug!(collection = T::COLLECTION, %id, "Generated key for new entity");
            return Ok(EntityState::Added);
        }

        let current = match tracker.get(T::COLLECTION, id) {
            Some(entry) if entry.is_instance(entity) => Some(entry.state),
            Some(_) => return Err(duplicate_instance::<T>(operation, id)),
            None => None,
        };

        let state = next(current);
        match (current, state) {
            (_, EntityState::Detached) => {
                tracker.remove(T::COLLECTION, id);
            }
            (None, _) => {
                if state == EntityState::Added {
                    entity.modify(|e| e.on_created(Utc::now()));
                }
                let original = if state == EntityState::Unchanged {
                    Some(to_row(entity, operation)?)
                } else {
                    None
                };
                tracker.insert(T::COLLECTION, id, TrackedEntry::new(entity, state, original));
            }
            (Some(previous), _) => {
                if state == EntityState::Added && previous != EntityState::Added {
                    entity.modify(|e| e.on_created(Utc::now()));
                }
                let baseline = if state == EntityState::Unchanged && previous != EntityState::Unchanged {
                    Some(to_row(entity, operation)?)
                } else {
                    None
                };
                if let Some(entry) = tracker.get_mut(T::COLLECTION, id) {
                    entry.state = state;
                    if baseline.is_some() {
                        entry.original = baseline;
                    }
                }
            }
        }

        tracing::debug!(collection = T::COLLECTION, %id, ?current, ?state, "Entity state changed");
        Ok(state)
    }

    /// Reject a batch before any of it is tracked when an instance collides
    /// with a different tracked instance or with another instance of the same
    /// batch. Instances with unassigned ids never collide.
    fn check_batch<T: Entity>(
        &self,
        entities: &[EntityRef<T>],
        operation: RepositoryOperation,
    ) -> RepositoryResult<()> {
        self.ensure_open(operation)?;
        let tracker = self.tracker();
        let mut seen: HashMap<EntityId, &EntityRef<T>> = HashMap::with_capacity(entities.len());

        for entity in entities {
            let id = entity.id();
            if id.is_nil() {
                continue;
            }
            let collides = match tracker.get(T::COLLECTION, id) {
                Some(entry) => !entry.is_instance(entity),
                None => seen.get(&id).is_some_and(|first| !first.ptr_eq(entity)),
            };
            if collides {
                return Err(duplicate_instance::<T>(operation, id));
            }
            seen.entry(id).or_insert(entity);
        }
        Ok(())
    }

    /// Return the tracked handle for a loaded row, or start tracking it
    pub(crate) fn resolve<T: Entity>(
        &self,
        entity: T,
        row: Row,
        no_tracking: bool,
        operation: RepositoryOperation,
    ) -> RepositoryResult<EntityRef<T>> {
        if no_tracking {
            return Ok(EntityRef::new(entity));
        }

        let id = entity.id();
        let mut tracker = self.tracker();
        if let Some(entry) = tracker.get(T::COLLECTION, id) {
            return entry
                .handle::<T>()
                .cloned()
                .ok_or_else(|| type_mismatch::<T>(operation, id));
        }

        let handle = EntityRef::new(entity);
        tracker.insert(
            T::COLLECTION,
            id,
            TrackedEntry::new(&handle, EntityState::Unchanged, Some(row)),
        );
        Ok(handle)
    }

    fn local<T: Entity>(
        &self,
        id: EntityId,
        operation: RepositoryOperation,
    ) -> RepositoryResult<Option<EntityRef<T>>> {
        match self.tracker().get(T::COLLECTION, id) {
            Some(entry) => entry
                .handle::<T>()
                .cloned()
                .map(Some)
                .ok_or_else(|| type_mismatch::<T>(operation, id)),
            None => Ok(None),
        }
    }

    fn find<T: Entity>(&self, id: EntityId) -> RepositoryResult<Option<EntityRef<T>>> {
        let operation = RepositoryOperation::GetById;
        self.ensure_open(operation)?;
        if let Some(tracked) = self.local::<T>(id, operation)? {
            return Ok(Some(tracked));
        }

        let row = self
            .store
            .fetch(T::COLLECTION, id)
            .map_err(|e| RepositoryError::from_store(operation, e))?;
        row.map(|row| self.resolve_row(row, operation)).transpose()
    }

    async fn find_async<T: Entity>(&self, id: EntityId) -> RepositoryResult<Option<EntityRef<T>>> {
        let operation = RepositoryOperation::GetById;
        self.ensure_open(operation)?;
        if let Some(tracked) = self.local::<T>(id, operation)? {
            return Ok(Some(tracked));
        }

        let row = self
            .store
            .fetch_async(T::COLLECTION, id)
            .await
            .map_err(|e| RepositoryError::from_store(operation, e))?;
        row.map(|row| self.resolve_row(row, operation)).transpose()
    }

    fn resolve_row<T: Entity>(
        &self,
        row: Row,
        operation: RepositoryOperation,
    ) -> RepositoryResult<EntityRef<T>> {
        let entity: T = serde_json::from_value(row.clone())
            .map_err(|e| RepositoryError::serialization(operation, e.to_string()))?;
        self.resolve(entity, row, false, operation)
    }

    /// Load `relations` into every entity in `owners`
    pub(crate) fn load_relations<T: Entity>(
        &self,
        owners: &[EntityRef<T>],
        relations: &[Relation<T>],
    ) -> RepositoryResult<()> {
        let operation = RepositoryOperation::LoadRelation;
        for relation in relations {
            match relation.kind() {
                RelationKind::Reference => {
                    for owner in owners {
                        let key = relation.foreign_key(&owner.read());
                        let rows = match key {
                            Some(key) => self
                                .store
                                .fetch(relation.target(), key)
                                .map_err(|e| RepositoryError::from_store(operation, e))?
                                .into_iter()
                                .collect(),
                            None => Vec::new(),
                        };
                        assign(owner, relation, rows)?;
                    }
                }
                RelationKind::Collection => {
                    let rows = self
                        .store
                        .scan(relation.target())
                        .map_err(|e| RepositoryError::from_store(operation, e))?;
                    for owner in owners {
                        assign(owner, relation, rows.clone())?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Load `relations` into every entity in `owners` without blocking
    pub(crate) async fn load_relations_async<T: Entity>(
        &self,
        owners: &[EntityRef<T>],
        relations: &[Relation<T>],
    ) -> RepositoryResult<()> {
        let operation = RepositoryOperation::LoadRelation;
        for relation in relations {
            match relation.kind() {
                RelationKind::Reference => {
                    let keys: Vec<Option<EntityId>> = owners
                        .iter()
                        .map(|owner| relation.foreign_key(&owner.read()))
                        .collect();
                    let fetched = try_join_all(keys.into_iter().map(|key| async move {
                        match key {
                            Some(key) => self.store.fetch_async(relation.target(), key).await,
                            None => Ok(None),
                        }
                    }))
                    .await
                    .map_err(|e| RepositoryError::from_store(operation, e))?;
                    for (owner, row) in owners.iter().zip(fetched) {
                        assign(owner, relation, row.into_iter().collect())?;
                    }
                }
                RelationKind::Collection => {
                    let rows = self
                        .store
                        .scan_async(relation.target())
                        .await
                        .map_err(|e| RepositoryError::from_store(operation, e))?;
                    for owner in owners {
                        assign(owner, relation, rows.clone())?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DbContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbContext")
            .field("store", &self.store)
            .field("tracked", &self.tracked_count())
            .field("disposed", &self.is_disposed())
            .field("flushes", &self.flush_count())
            .finish()
    }
}

/// Resolve include directive names against `T`'s declared relations
pub(crate) fn resolve_relations<T: Entity, S: AsRef<str>>(
    names: &[S],
    operation: RepositoryOperation,
) -> RepositoryResult<Vec<Relation<T>>> {
    names
        .iter()
        .map(|name| {
            let name = name.as_ref();
            find_relation::<T>(name).ok_or_else(|| {
                RepositoryError::invalid_argument(operation, format!("unknown relation `{name}`"))
                    .with_entity_type(T::COLLECTION)
            })
        })
        .collect()
}

fn assign<T: Entity>(
    owner: &EntityRef<T>,
    relation: &Relation<T>,
    rows: Vec<Row>,
) -> RepositoryResult<()> {
    relation.assign(&mut owner.write(), rows).map_err(|e| {
        RepositoryError::serialization(
            RepositoryOperation::LoadRelation,
            format!("relation `{}`: {e}", relation.name()),
        )
    })
}

fn to_row<T: Entity>(entity: &EntityRef<T>, operation: RepositoryOperation) -> RepositoryResult<Row> {
    serde_json::to_value(&*entity.read())
        .map_err(|e| RepositoryError::serialization(operation, e.to_string()))
}

fn duplicate_instance<T: Entity>(operation: RepositoryOperation, id: EntityId) -> RepositoryError {
    RepositoryError::invalid_argument(
        operation,
        "another instance with the same id is already being tracked",
    )
    .with_entity(T::COLLECTION, id.to_string())
}

fn type_mismatch<T: Entity>(operation: RepositoryOperation, id: EntityId) -> RepositoryError {
    RepositoryError::invalid_argument(
        operation,
        "collection is tracked under a different entity type",
    )
    .with_entity(T::COLLECTION, id.to_string())
}

/// Typed view over the collection of `T` in a context
pub struct EntitySet<'ctx, T> {
    context: &'ctx DbContext,
    _entity: PhantomData<fn() -> T>,
}

impl<'ctx, T: Entity> EntitySet<'ctx, T> {
    /// Mark an instance for insertion
    pub fn add(&self, entity: &EntityRef<T>) -> RepositoryResult<()> {
        self.context
            .transition(entity, RepositoryOperation::Add, |current| match current {
                Some(EntityState::Deleted) => EntityState::Modified,
                _ => EntityState::Added,
            })
            .map(drop)
    }

    /// Mark several instances for insertion.
    ///
    /// All or nothing: if any instance collides with a tracked instance or
    /// with another instance in `entities`, none of them is tracked.
    pub fn add_range(&self, entities: &[EntityRef<T>]) -> RepositoryResult<()> {
        self.context.check_batch(entities, RepositoryOperation::Add)?;
        entities.iter().try_for_each(|entity| self.add(entity))
    }

    /// Async form of [`add_range`](Self::add_range) for async call sites;
    /// nothing here touches the store.
    pub async fn add_range_async(&self, entities: &[EntityRef<T>]) -> RepositoryResult<()> {
        self.add_range(entities)
    }

    /// Start tracking an instance as `Unchanged` without marking it dirty
    pub fn attach(&self, entity: &EntityRef<T>) -> RepositoryResult<()> {
        self.context
            .transition(entity, RepositoryOperation::Attach, |current| {
                current.unwrap_or(EntityState::Unchanged)
            })
            .map(drop)
    }

    /// Track an instance as `Modified` (or `Added` if its id is unassigned)
    pub fn update(&self, entity: &EntityRef<T>) -> RepositoryResult<()> {
        self.context
            .transition(entity, RepositoryOperation::Update, |current| match current {
                Some(EntityState::Added) => EntityState::Added,
                _ => EntityState::Modified,
            })
            .map(drop)
    }

    /// Mark an instance for deletion; a pending insert is simply detached
    pub fn remove(&self, entity: &EntityRef<T>) -> RepositoryResult<()> {
        self.context
            .transition(entity, RepositoryOperation::Delete, |current| match current {
                Some(EntityState::Added) => EntityState::Detached,
                _ => EntityState::Deleted,
            })
            .map(drop)
    }

    /// Mark several instances for deletion; all or nothing, like
    /// [`add_range`](Self::add_range)
    pub fn remove_range(&self, entities: &[EntityRef<T>]) -> RepositoryResult<()> {
        self.context.check_batch(entities, RepositoryOperation::Delete)?;
        entities.iter().try_for_each(|entity| self.remove(entity))
    }

    /// Resolve an id: tracked instance first, then the store (tracking the
    /// loaded instance)
    pub fn find(&self, id: EntityId) -> RepositoryResult<Option<EntityRef<T>>> {
        self.context.find::<T>(id)
    }

    /// Resolve an id without blocking
    pub async fn find_async(&self, id: EntityId) -> RepositoryResult<Option<EntityRef<T>>> {
        self.context.find_async::<T>(id).await
    }

    /// Whether an instance with `id` is in the tracked set. Never touches the
    /// store.
    pub fn is_tracked(&self, id: EntityId) -> bool {
        self.context.tracker().contains(T::COLLECTION, id)
    }

    /// Every tracked instance of `T`, in no particular order
    pub fn local(&self) -> Vec<EntityRef<T>> {
        self.context.tracker().handles::<T>()
    }

    /// Lazy, tracking query over every stored `T`
    pub fn query(&self) -> Query<'ctx, T> {
        Query::new(self.context, QuerySpec::new().tracking())
    }
}

/// Tracking information and explicit loading for one instance
pub struct EntityEntry<'ctx, T> {
    context: &'ctx DbContext,
    entity: EntityRef<T>,
}

impl<'ctx, T: Entity> EntityEntry<'ctx, T> {
    /// The instance this entry describes
    pub fn entity(&self) -> &EntityRef<T> {
        &self.entity
    }

    /// Current state; `Detached` unless this exact instance is tracked
    pub fn state(&self) -> EntityState {
        let id = self.entity.id();
        match self.context.tracker().get(T::COLLECTION, id) {
            Some(entry) if entry.is_instance(&self.entity) => entry.state,
            _ => EntityState::Detached,
        }
    }

    /// Force the instance into `state`, attaching it first if needed
    pub fn set_state(&self, state: EntityState) -> RepositoryResult<()> {
        self.context
            .transition(&self.entity, RepositoryOperation::Attach, |_| state)
            .map(drop)
    }

    /// Load a reference relation into the instance
    pub fn load_reference(&self, name: &str) -> RepositoryResult<()> {
        let relation = self.reference(name)?;
        self.context
            .load_relations(std::slice::from_ref(&self.entity), std::slice::from_ref(&relation))
    }

    /// Load a reference relation into the instance without blocking
    pub async fn load_reference_async(&self, name: &str) -> RepositoryResult<()> {
        let relation = self.reference(name)?;
        self.context
            .load_relations_async(std::slice::from_ref(&self.entity), std::slice::from_ref(&relation))
            .await
    }

    fn reference(&self, name: &str) -> RepositoryResult<Relation<T>> {
        let operation = RepositoryOperation::LoadRelation;
        let relation = find_relation::<T>(name).ok_or_else(|| {
            RepositoryError::invalid_argument(operation, format!("unknown relation `{name}`"))
                .with_entity_type(T::COLLECTION)
        })?;
        if relation.kind() != RelationKind::Reference {
            return Err(RepositoryError::invalid_argument(
                operation,
                format!("relation `{name}` is a {} relation, not a reference", relation.kind()),
            )
            .with_entity_type(T::COLLECTION));
        }
        Ok(relation)
    }
}
