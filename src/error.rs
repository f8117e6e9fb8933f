use thiserror::Error;
use uuid::Uuid;

use crate::protocol::types::{ProtocolType, Stage};

/// Errors raised by the workflow core.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("Protocol {number} is already {stage} and cannot change")]
    TerminalState { number: String, stage: Stage },

    #[error("No workflow definition registered for protocol type '{0}'")]
    UnknownType(String),

    #[error("Completion handler for {protocol_type} failed: {reason}")]
    SideEffect {
        protocol_type: ProtocolType,
        reason: String,
    },

    #[error("Protocol number {number} is already taken after {attempts} attempts")]
    DuplicateProtocolNumber { number: String, attempts: u32 },

    #[error("Protocol {0} not found")]
    NotFound(String),

    #[error("Actor {actor} lacks capability '{capability}'")]
    Unauthorized { actor: String, capability: String },

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Protocol {number} was modified concurrently; reload and retry")]
    StaleProtocol { number: String },

    #[error("Invalid workflow definition for {protocol_type}: {reason}")]
    InvalidDefinition {
        protocol_type: ProtocolType,
        reason: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl WorkflowError {
    pub fn validation(message: impl Into<String>) -> Self {
        WorkflowError::Validation(vec![message.into()])
    }

    /// Whether the failure came from a rejected request rather than the backend.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, WorkflowError::Storage(_) | WorkflowError::SideEffect { .. })
    }
}

/// Errors raised by persistence backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Protocol number {0} already exists")]
    DuplicateNumber(String),

    #[error("Record {0} not found")]
    NotFound(Uuid),

    #[error("Version conflict on {id}: expected {expected}, found {found}")]
    VersionConflict { id: Uuid, expected: i64, found: i64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock acquisition failed: {reason}")]
    Lock { reason: String },

    #[error("Duplicate member national id {0}")]
    DuplicateMember(String),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
