//! # entity-repository
//!
//! Generic, change-tracking entity repository with a blocking and an async form
//! of every mutating operation.
//!
//! ## Features
//!
//! - **Generic repository**: one `EntityRepository<T>` per entity type with CRUD,
//!   bulk add/delete-by-id, range delete and query operations
//! - **Change tracking**: a `DbContext` unit of work that tracks entity handles
//!   (`Added`, `Modified`, `Deleted`, `Unchanged`, `Detached`) and flushes them
//!   atomically
//! - **Composable queries**: filter predicates, include directives, ordering and
//!   a no-tracking flag, evaluated lazily
//! - **Pluggable stores**: in-memory and JSON-file backing stores behind one trait
//! - **Layered configuration**: Figment (defaults, TOML, environment)
//!
//! ## Example
//!
//! ```rust,no_run
//! use entity_repository::prelude::*;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Note {
//!     id: EntityId,
//!     text: String,
//! }
//!
//! impl Entity for Note {
//!     const COLLECTION: &'static str = "notes";
//!
//!     fn id(&self) -> EntityId {
//!         self.id
//!     }
//!
//!     fn set_id(&mut self, id: EntityId) {
//!         self.id = id;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let context = DbContext::from_config(&config)?;
//!     let notes = EntityRepository::<Note>::new(&context)?;
//!
//!     let note = EntityRef::new(Note { id: EntityId::nil(), text: "hello".into() });
//!     notes.add_async(&note).await?;
//!
//!     let found = notes.get_by_id_async(note.id(), true, &[]).await?;
//!     assert!(found.is_some());
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod observability;
pub mod repository;
pub mod schema;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use entity::{new_entity_id, Entity, EntityId, EntityRef};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, ContextConfig, ServiceConfig, StoreBackend, StoreConfig};
    pub use crate::context::{DbContext, EntityEntry, EntitySet, EntityState};
    pub use crate::entity::{new_entity_id, Entity, EntityId, EntityRef};
    pub use crate::error::{Error, Result};
    pub use crate::observability::init_tracing;
    pub use crate::repository::{
        EntityRepository, GenericRepository, Query, QuerySpec, RepositoryError,
        RepositoryErrorKind, RepositoryOperation, RepositoryResult,
    };
    pub use crate::schema::{Relation, RelationKind};
    pub use crate::store::{BackingStore, JsonFileStore, MemoryStore};

    pub use serde::{Deserialize, Serialize};
}
