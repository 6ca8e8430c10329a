//! Query specifications and lazy queries
//!
//! A [`QuerySpec`] is the per-call description of a read: a filter predicate,
//! the relations to include (in order), an optional ordering and a tracking
//! flag. Nothing about it touches the store. A [`Query`] binds a spec to a
//! context; the store is only read when the query is enumerated with
//! [`to_list`](Query::to_list) or one of its async forms.
//!
//! # Example
//!
//! ```rust,ignore
//! let spec = QuerySpec::<Entry>::new()
//!     .filter(|e| e.subject == "rust")
//!     .include("author")
//!     .order_by_key(|e| e.created_at);
//!
//! let entries = repo.get_list(spec)?;
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use super::error::{RepositoryError, RepositoryOperation};
use super::traits::RepositoryResult;
use crate::context::{resolve_relations, DbContext};
use crate::entity::{Entity, EntityRef};
use crate::store::Row;

/// Filter predicate over entity values
pub type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Total order over entity values
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Filter, includes, ordering and tracking for one read.
///
/// Specs default to no-tracking reads; call [`tracking`](Self::tracking) to
/// have results tracked by the context.
pub struct QuerySpec<T> {
    filter: Option<Predicate<T>>,
    includes: Vec<String>,
    order_by: Option<Comparator<T>>,
    no_tracking: bool,
}

impl<T> Default for QuerySpec<T> {
    fn default() -> Self {
        Self {
            filter: None,
            includes: Vec::new(),
            order_by: None,
            no_tracking: true,
        }
    }
}

impl<T> Clone for QuerySpec<T> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            includes: self.includes.clone(),
            order_by: self.order_by.clone(),
            no_tracking: self.no_tracking,
        }
    }
}

impl<T> fmt::Debug for QuerySpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySpec")
            .field("filtered", &self.filter.is_some())
            .field("includes", &self.includes)
            .field("ordered", &self.order_by.is_some())
            .field("no_tracking", &self.no_tracking)
            .finish()
    }
}

impl<T: Entity> QuerySpec<T> {
    /// Unfiltered, unordered, no-tracking spec
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter. Repeated calls are combined with logical AND.
    #[must_use]
    pub fn filter(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        let combined: Predicate<T> = match self.filter.take() {
            Some(existing) => Arc::new(move |entity: &T| existing(entity) && predicate(entity)),
            None => Arc::new(predicate),
        };
        self.filter = Some(combined);
        self
    }

    /// Eagerly load the named relation into every result
    #[must_use]
    pub fn include(mut self, relation: impl Into<String>) -> Self {
        self.includes.push(relation.into());
        self
    }

    /// Order results with a comparator. Replaces any previous ordering.
    #[must_use]
    pub fn order_by(mut self, compare: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        self.order_by = Some(Arc::new(compare));
        self
    }

    /// Order results ascending by a key
    #[must_use]
    pub fn order_by_key<K: Ord>(self, key: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        self.order_by(move |a, b| key(a).cmp(&key(b)))
    }

    /// Order results descending by a key
    #[must_use]
    pub fn order_by_key_desc<K: Ord>(self, key: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        self.order_by(move |a, b| key(b).cmp(&key(a)))
    }

    /// Set the tracking flag
    #[must_use]
    pub fn no_tracking(mut self, no_tracking: bool) -> Self {
        self.no_tracking = no_tracking;
        self
    }

    /// Track results in the context
    #[must_use]
    pub fn tracking(self) -> Self {
        self.no_tracking(false)
    }

    /// Whether results are detached from the context
    pub fn is_no_tracking(&self) -> bool {
        self.no_tracking
    }

    /// Relation names to include, in order
    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    /// Whether a filter is set
    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    /// Whether an ordering is set
    pub fn has_order(&self) -> bool {
        self.order_by.is_some()
    }

    pub(crate) fn unordered(mut self) -> Self {
        self.order_by = None;
        self
    }

    pub(crate) fn matches(&self, entity: &T) -> bool {
        self.filter.as_ref().map_or(true, |predicate| predicate(entity))
    }
}

/// Lazy query over the stored entities of type `T`
pub struct Query<'ctx, T> {
    context: &'ctx DbContext,
    spec: QuerySpec<T>,
}

impl<'ctx, T: Entity> Query<'ctx, T> {
    pub(crate) fn new(context: &'ctx DbContext, spec: QuerySpec<T>) -> Self {
        Self { context, spec }
    }

    /// The spec this query will run
    pub fn spec(&self) -> &QuerySpec<T> {
        &self.spec
    }

    /// Narrow the query (AND-composed with existing filters)
    #[must_use]
    pub fn filter(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.map_spec(|spec| spec.filter(predicate))
    }

    /// Eagerly load a relation into every result
    #[must_use]
    pub fn include(self, relation: impl Into<String>) -> Self {
        self.map_spec(|spec| spec.include(relation))
    }

    /// Order results with a comparator
    #[must_use]
    pub fn order_by(self, compare: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        self.map_spec(|spec| spec.order_by(compare))
    }

    /// Order results ascending by a key
    #[must_use]
    pub fn order_by_key<K: Ord>(self, key: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        self.map_spec(|spec| spec.order_by_key(key))
    }

    /// Detach results from the context
    #[must_use]
    pub fn as_no_tracking(self) -> Self {
        self.map_spec(|spec| spec.no_tracking(true))
    }

    /// Track results in the context
    #[must_use]
    pub fn as_tracking(self) -> Self {
        self.map_spec(QuerySpec::tracking)
    }

    fn map_spec(self, f: impl FnOnce(QuerySpec<T>) -> QuerySpec<T>) -> Self {
        Self {
            context: self.context,
            spec: f(self.spec),
        }
    }

    /// Enumerate the query
    pub fn to_list(&self) -> RepositoryResult<Vec<EntityRef<T>>> {
        let operation = RepositoryOperation::Query;
        self.context.ensure_open(operation)?;
        let relations = resolve_relations::<T, _>(self.spec.includes(), operation)?;

        let rows = self
            .context
            .store()
            .scan(T::COLLECTION)
            .map_err(|e| RepositoryError::from_store(operation, e))?;
        let results = self.materialize(self.select(rows, operation)?, operation)?;

        self.context.load_relations(&results, &relations)?;
        Ok(results)
    }

    /// Enumerate the query without blocking
    pub async fn to_list_async(&self) -> RepositoryResult<Vec<EntityRef<T>>> {
        let operation = RepositoryOperation::Query;
        let relations = resolve_relations::<T, _>(self.spec.includes(), operation)?;
        let selected = self.select_async(operation).await?;
        let results = self.materialize(selected, operation)?;

        self.context.load_relations_async(&results, &relations).await?;
        Ok(results)
    }

    /// First result in query order, if any
    pub async fn first_async(&self) -> RepositoryResult<Option<EntityRef<T>>> {
        let operation = RepositoryOperation::Query;
        let mut selected = self.select_async(operation).await?;
        selected.truncate(1);
        self.one_async(selected, operation).await
    }

    /// The only result, if any. More than one match is an error.
    pub async fn single_async(&self) -> RepositoryResult<Option<EntityRef<T>>> {
        let operation = RepositoryOperation::Query;
        let selected = self.select_async(operation).await?;
        if selected.len() > 1 {
            return Err(RepositoryError::multiple_results(
                operation,
                T::COLLECTION,
                selected.len(),
            ));
        }
        self.one_async(selected, operation).await
    }

    /// Number of matching entities. Nothing is tracked.
    pub fn count(&self) -> RepositoryResult<usize> {
        let operation = RepositoryOperation::Query;
        self.context.ensure_open(operation)?;
        let rows = self
            .context
            .store()
            .scan(T::COLLECTION)
            .map_err(|e| RepositoryError::from_store(operation, e))?;
        Ok(self.select(rows, operation)?.len())
    }

    /// Number of matching entities without blocking
    pub async fn count_async(&self) -> RepositoryResult<usize> {
        Ok(self.select_async(RepositoryOperation::Query).await?.len())
    }

    async fn select_async(&self, operation: RepositoryOperation) -> RepositoryResult<Vec<(T, Row)>> {
        self.context.ensure_open(operation)?;
        let rows = self
            .context
            .store()
            .scan_async(T::COLLECTION)
            .await
            .map_err(|e| RepositoryError::from_store(operation, e))?;
        self.select(rows, operation)
    }

    async fn one_async(
        &self,
        selected: Vec<(T, Row)>,
        operation: RepositoryOperation,
    ) -> RepositoryResult<Option<EntityRef<T>>> {
        let relations = resolve_relations::<T, _>(self.spec.includes(), operation)?;
        let results = self.materialize(selected, operation)?;
        self.context.load_relations_async(&results, &relations).await?;
        Ok(results.into_iter().next())
    }

    /// Decode rows, apply the filter, then the ordering (stable)
    fn select(&self, rows: Vec<Row>, operation: RepositoryOperation) -> RepositoryResult<Vec<(T, Row)>> {
        let mut selected = Vec::new();
        for row in rows {
            let entity: T = serde_json::from_value(row.clone()).map_err(|e| {
                RepositoryError::serialization(operation, e.to_string()).with_entity_type(T::COLLECTION)
            })?;
            if self.spec.matches(&entity) {
                selected.push((entity, row));
            }
        }
        if let Some(compare) = &self.spec.order_by {
            selected.sort_by(|(a, _), (b, _)| compare(a, b));
        }
        Ok(selected)
    }

    fn materialize(
        &self,
        selected: Vec<(T, Row)>,
        operation: RepositoryOperation,
    ) -> RepositoryResult<Vec<EntityRef<T>>> {
        selected
            .into_iter()
            .map(|(entity, row)| self.context.resolve(entity, row, self.spec.is_no_tracking(), operation))
            .collect()
    }
}

impl<T> fmt::Debug for Query<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query").field("spec", &self.spec).finish()
    }
}
