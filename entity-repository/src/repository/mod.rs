//! Generic entity repository
//!
//! This module provides the repository contract and its implementation over a
//! [`DbContext`](crate::context::DbContext).
//!
//! # Features
//!
//! - **CRUD**: [`GenericRepository`] with a blocking and an async form for every
//!   mutating operation
//! - **Local upsert**: `add_or_update` consults the context's tracked set only
//! - **Querying**: [`QuerySpec`] (filter, includes, ordering, tracking) and lazy
//!   [`Query`] handles
//! - **Structured errors**: [`RepositoryError`] with operation and entity context
//!
//! # Example
//!
//! ```rust,ignore
//! use entity_repository::prelude::*;
//!
//! let context = DbContext::in_memory();
//! let repo = EntityRepository::<Entry>::new(&context)?;
//!
//! repo.add(&EntityRef::new(Entry::new("rust", "lifetimes")))?;
//!
//! let latest = repo.get_list(
//!     QuerySpec::new()
//!         .filter(|e: &Entry| e.subject == "rust")
//!         .order_by_key_desc(|e| e.created_at),
//! )?;
//!
//! // Missing ids are absence, not errors
//! assert!(repo.delete_by_id(EntityId::now_v7())?.is_none());
//! ```

mod error;
mod generic;
mod query;
mod traits;

// Re-export all public types
pub use error::{RepositoryError, RepositoryErrorKind, RepositoryOperation};
pub use generic::EntityRepository;
pub use query::{Comparator, Predicate, Query, QuerySpec};
pub use traits::{GenericRepository, RepositoryResult};
