//! Error types for the authorization engine

use crate::types::{Role, SubjectId};
use thiserror::Error;

/// Authorization engine errors
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Resolution found zero roles for the subject
    #[error("No role assigned to subject: {0}")]
    NoRoleAssigned(SubjectId),

    /// A held role has no entry in the permission table
    #[error("Role has no permission table entry: {0}")]
    UnmappedRole(Role),

    /// Post-repair verification still found divergence
    #[error("Repair ineffective for subject {subject}: {reason}")]
    RepairIneffective {
        subject: SubjectId,
        reason: String,
    },

    /// Another repair holds the subject's repair slot
    #[error("Repair already in progress for subject: {0}")]
    RepairInProgress(SubjectId),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid engine configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Role record store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthzError {
    /// Whether an external caller may retry the failed operation.
    ///
    /// `RepairIneffective` is terminal until an operator clears the subject.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::RepairInProgress(_))
    }
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;
