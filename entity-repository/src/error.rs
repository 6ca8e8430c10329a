//! Crate-level error type

use thiserror::Error;

use crate::repository::RepositoryError;
use crate::store::StoreError;

/// Result type alias using the crate error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for setup and wiring
///
/// Repository calls return [`RepositoryError`] directly; this type covers
/// everything around them (loading configuration, opening stores, installing
/// the tracing subscriber). Large error variants are boxed to reduce stack size.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Configuration loaded but failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Structured repository error with operation context
    #[error("{0}")]
    Repository(#[from] RepositoryError),

    /// Backing store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tracing subscriber could not be installed
    #[error("Tracing error: {0}")]
    Tracing(String),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}
