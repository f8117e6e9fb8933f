// Protocol Workflow Library - approval workflows for member assemblies
// This exposes the core components for the CLI, testing and integration

pub mod audit;
pub mod config;
pub mod error;
pub mod protocol;
pub mod store;
pub mod telemetry;

// Re-export key types for easy access
pub use audit::{AuditAction, AuditEntry, AuditLogger, MoneyFormat, Timeline};
pub use config::{config, ProtocolWorkflowConfig};
pub use error::{StoreError, WorkflowError, WorkflowResult};
pub use protocol::{
    Actor, CompletionEffects, MemberDirectory, NewProtocol, Protocol, ProtocolNumber, ProtocolStatus,
    ProtocolType, SideEffectReport, Stage, TransitionExecutor, TransitionOutcome, WorkflowRegistry,
};
pub use store::{MemoryStore, ProtocolFilter, ProtocolStore, SnapshotFile};
pub use telemetry::{create_protocol_span, generate_correlation_id, init_telemetry};
