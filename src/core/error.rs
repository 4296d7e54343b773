//! KN-007: Error taxonomy for module building, resolution, journaling, and execution.
//!
//! Structural errors (duplicate ids, cycles, journal conflicts) abort before any
//! side effect. Creation failures are partial: they are recorded in the journal
//! and surfaced as [`ProvisioningError`] so a later run can resume.

use thiserror::Error;

/// Failure reported by an external creation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CreationError {
    pub message: String,
}

impl CreationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A creation failure with the plan context it happened in.
#[derive(Debug, Clone, Error)]
#[error("failed to materialize {module}#{descriptor} ({kind}): {cause}")]
pub struct ProvisioningError {
    pub module: String,
    pub descriptor: String,
    pub kind: String,
    /// Descriptors that completed in this run before the failure.
    pub completed: Vec<String>,
    #[source]
    pub cause: CreationError,
}

/// Every error the engine can return.
#[derive(Debug, Error)]
pub enum KilnError {
    #[error("duplicate descriptor id '{id}' in module '{module}'")]
    DuplicateId { module: String, id: String },

    #[error("invalid descriptor id '{0}' (expected [A-Za-z_][A-Za-z0-9_]*)")]
    InvalidId(String),

    #[error("descriptor '{from}' references unknown descriptor '{to}'")]
    UnknownReference { from: String, to: String },

    #[error("output '{name}' binds unknown descriptor '{id}'")]
    UnknownOutput { name: String, id: String },

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("journal conflict for {key}: {detail}")]
    JournalConflict { key: String, detail: String },

    #[error("invalid journal transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: String,
        to: String,
    },

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    /// The creator succeeded but the Completed write did not land.
    #[error("{key} was created as {result} but could not be journaled: {source}")]
    Unrecorded {
        key: String,
        result: String,
        source: Box<KilnError>,
    },

    #[error("journal store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),
}

impl From<rusqlite::Error> for KilnError {
    fn from(err: rusqlite::Error) -> Self {
        KilnError::Store(err.to_string())
    }
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Store(err.to_string())
    }
}

pub type Result<T, E = KilnError> = std::result::Result<T, E>;
