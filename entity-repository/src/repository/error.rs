//! Repository error types
//!
//! Every failure a repository call can produce is a [`RepositoryError`]: the
//! operation that was running, a [`RepositoryErrorKind`] category, a message,
//! and (when known) the entity type and id involved.
//!
//! Identifier lookups that miss are *not* errors; they surface as `Ok(None)`.
//!
//! # Example
//!
//! ```rust
//! use entity_repository::repository::{RepositoryError, RepositoryErrorKind, RepositoryOperation};
//!
//! let error = RepositoryError::not_supported(RepositoryOperation::BulkUpdate, "entries");
//! assert!(matches!(error.kind, RepositoryErrorKind::NotSupported));
//! assert_eq!(error.entity_type.as_deref(), Some("entries"));
//! ```

use std::fmt;

use crate::store::StoreError;

/// Operation being performed when the repository error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryOperation {
    /// Constructing a repository over a context
    Construct,
    /// Adding one or more entities
    Add,
    /// Local-only upsert
    AddOrUpdate,
    /// Adding a batch with a single flush
    BulkAdd,
    /// Set-based delete by predicate or instances
    BulkDelete,
    /// Deleting a batch of identifiers
    BulkDeleteById,
    /// Set-based update
    BulkUpdate,
    /// Deleting a single entity
    Delete,
    /// Deleting every entity matching a predicate
    DeleteRange,
    /// First-or-default lookup
    FirstAllDefault,
    /// Loading every entity of a type
    GetAll,
    /// Resolving an entity by identifier
    GetById,
    /// Materializing a filtered, ordered list
    GetList,
    /// Single-or-default lookup
    GetSingle,
    /// Full-row update
    Update,
    /// Flushing pending changes
    SaveChanges,
    /// Bringing an instance under tracking
    Attach,
    /// Evaluating a query
    Query,
    /// Loading a declared relation
    LoadRelation,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Construct => write!(f, "construct"),
            Self::Add => write!(f, "add"),
            Self::AddOrUpdate => write!(f, "add_or_update"),
            Self::BulkAdd => write!(f, "bulk_add"),
            Self::BulkDelete => write!(f, "bulk_delete"),
            Self::BulkDeleteById => write!(f, "bulk_delete_by_id"),
            Self::BulkUpdate => write!(f, "bulk_update"),
            Self::Delete => write!(f, "delete"),
            Self::DeleteRange => write!(f, "delete_range"),
            Self::FirstAllDefault => write!(f, "first_all_default"),
            Self::GetAll => write!(f, "get_all"),
            Self::GetById => write!(f, "get_by_id"),
            Self::GetList => write!(f, "get_list"),
            Self::GetSingle => write!(f, "get_single"),
            Self::Update => write!(f, "update"),
            Self::SaveChanges => write!(f, "save_changes"),
            Self::Attach => write!(f, "attach"),
            Self::Query => write!(f, "query"),
            Self::LoadRelation => write!(f, "load_relation"),
        }
    }
}

/// Category of repository error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryErrorKind {
    /// Bad construction or call input (disposed context, unknown relation,
    /// conflicting tracked instance)
    InvalidArgument,
    /// Identifier resolution miss. Repository lookups return `Ok(None)`
    /// instead; see [`RepositoryError::not_found`].
    NotFound,
    /// A single-result query matched more than one entity
    MultipleResultsFound,
    /// The operation is declared but intentionally unimplemented
    NotSupported,
    /// The store rejected the flush (duplicate key)
    ConstraintViolation,
    /// A row the flush expected to update or delete no longer exists
    ConcurrencyConflict,
    /// The store could not be reached or written
    StorageUnavailable,
    /// An entity could not be converted to or from its stored row
    Serialization,
}

impl fmt::Display for RepositoryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid_argument"),
            Self::NotFound => write!(f, "not_found"),
            Self::MultipleResultsFound => write!(f, "multiple_results_found"),
            Self::NotSupported => write!(f, "not_supported"),
            Self::ConstraintViolation => write!(f, "constraint_violation"),
            Self::ConcurrencyConflict => write!(f, "concurrency_conflict"),
            Self::StorageUnavailable => write!(f, "storage_unavailable"),
            Self::Serialization => write!(f, "serialization"),
        }
    }
}

/// Structured repository error with operation context
///
/// # Example
///
/// ```rust
/// use entity_repository::repository::{RepositoryError, RepositoryOperation};
///
/// let error = RepositoryError::multiple_results(RepositoryOperation::GetSingle, "entries", 2);
/// assert_eq!(
///     error.to_string(),
///     "Repository multiple_results_found error during get_single: \
///      Sequence contains 2 matching elements [entries]"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryError {
    /// The operation being performed when the error occurred
    pub operation: RepositoryOperation,
    /// The category of error
    pub kind: RepositoryErrorKind,
    /// Human-readable error message
    pub message: String,
    /// The collection of the entity involved (e.g., "entries")
    pub entity_type: Option<String>,
    /// The ID of the entity involved
    pub entity_id: Option<String>,
}

impl RepositoryError {
    /// Create a new repository error
    pub fn new(
        operation: RepositoryOperation,
        kind: RepositoryErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            entity_type: None,
            entity_id: None,
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::InvalidArgument, message)
    }

    /// Create a "not found" error with entity context
    ///
    /// Repository lookups report misses as `Ok(None)`; this constructor is for
    /// callers that want to turn that absence into an error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(
            RepositoryOperation::GetById,
            RepositoryErrorKind::NotFound,
            "Entity not found",
        )
        .with_entity(entity_type, entity_id)
    }

    /// Create the error raised when a single-result query matches `count` rows
    pub fn multiple_results(
        operation: RepositoryOperation,
        entity_type: impl Into<String>,
        count: usize,
    ) -> Self {
        Self::new(
            operation,
            RepositoryErrorKind::MultipleResultsFound,
            format!("Sequence contains {count} matching elements"),
        )
        .with_entity_type(entity_type)
    }

    /// Create the error returned by operations that are declared but not implemented
    pub fn not_supported(operation: RepositoryOperation, entity_type: impl Into<String>) -> Self {
        Self::new(
            operation,
            RepositoryErrorKind::NotSupported,
            format!("{operation} is not implemented"),
        )
        .with_entity_type(entity_type)
    }

    /// Create a serialization error
    pub fn serialization(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::Serialization, message)
    }

    /// Translate a backing store failure into a repository error
    pub fn from_store(operation: RepositoryOperation, error: StoreError) -> Self {
        match error {
            StoreError::DuplicateKey { collection, id } => Self::new(
                operation,
                RepositoryErrorKind::ConstraintViolation,
                "Duplicate key",
            )
            .with_entity(collection, id.to_string()),
            StoreError::MissingRow { collection, id } => Self::new(
                operation,
                RepositoryErrorKind::ConcurrencyConflict,
                "Expected to affect 1 row but affected 0",
            )
            .with_entity(collection, id.to_string()),
            StoreError::Serialization(e) => Self::serialization(operation, e.to_string()),
            other => Self::new(
                operation,
                RepositoryErrorKind::StorageUnavailable,
                other.to_string(),
            ),
        }
    }

    /// Add entity context to an existing error
    #[must_use]
    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Add only the entity type to an existing error
    #[must_use]
    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Set the operation that caused the error
    #[must_use]
    pub fn with_operation(mut self, operation: RepositoryOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Whether the error came from a failed flush or store access
    pub fn is_persistence_failure(&self) -> bool {
        matches!(
            self.kind,
            RepositoryErrorKind::ConstraintViolation
                | RepositoryErrorKind::ConcurrencyConflict
                | RepositoryErrorKind::StorageUnavailable
                | RepositoryErrorKind::Serialization
        )
    }

    /// Check if this error is transient. Nothing in this crate retries; the
    /// classification is for callers.
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind, RepositoryErrorKind::StorageUnavailable)
    }
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Repository {} error during {}: {}",
            self.kind, self.operation, self.message
        )?;
        match (&self.entity_type, &self.entity_id) {
            (Some(entity_type), Some(entity_id)) => write!(f, " [{}: {}]", entity_type, entity_id)?,
            (Some(entity_type), None) => write!(f, " [{}]", entity_type)?,
            _ => {}
        }
        Ok(())
    }
}

impl std::error::Error for RepositoryError {}
