//! Error types for the key registry

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Missing required parameter: {field}")]
    MissingParameter { field: &'static str },

    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Could not generate a unique key after {attempts} attempts")]
    KeyCollision { attempts: usize },

    #[error("Failed to persist registry state: {0}")]
    PersistenceFailure(#[from] anyhow::Error),
}

impl RegistryError {
    pub fn missing(field: &'static str) -> Self {
        Self::MissingParameter { field }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
