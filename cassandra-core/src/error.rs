//! Cassandra operator error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The referenced resource could not be found.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
}
