//! Error types for addon lifecycle operations.
//!
//! Two kinds exist: a generic operational failure carrying a message, and a
//! structured registry failure raised when the remote registry answers a
//! download with a JSON error envelope. Callers can branch on the registry's
//! reported code through [`AddonError::code`].

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddonError {
    /// Generic operational failure (filesystem, archive, hook, database).
    #[error("{0}")]
    Operation(String),

    /// Structured failure reported by the remote registry.
    #[error("{msg}")]
    Registry { msg: String, code: i64, data: Value },
}

impl AddonError {
    pub fn operation(msg: impl Into<String>) -> Self {
        AddonError::Operation(msg.into())
    }

    /// Registry code, or 0 for operational failures.
    pub fn code(&self) -> i64 {
        match self {
            AddonError::Operation(_) => 0,
            AddonError::Registry { code, .. } => *code,
        }
    }

    /// Registry payload, or `Null` for operational failures.
    pub fn data(&self) -> &Value {
        match self {
            AddonError::Operation(_) => &Value::Null,
            AddonError::Registry { data, .. } => data,
        }
    }

    pub fn is_registry(&self) -> bool {
        matches!(self, AddonError::Registry { .. })
    }
}

impl From<anyhow::Error> for AddonError {
    fn from(err: anyhow::Error) -> Self {
        // Keep a structured error intact when it was wrapped on the way up.
        match err.downcast::<AddonError>() {
            Ok(inner) => inner,
            Err(err) => AddonError::Operation(format!("{:#}", err)),
        }
    }
}

pub type AddonResult<T> = std::result::Result<T, AddonError>;
