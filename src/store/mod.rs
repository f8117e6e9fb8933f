// Persistence for protocols, their audit trail and the member directory

pub mod file;
pub mod memory;
#[cfg(feature = "database")]
pub mod sqlite;

use async_trait::async_trait;

use crate::audit::AuditEntry;
use crate::error::StoreError;
use crate::protocol::numbering::ProtocolNumber;
use crate::protocol::types::{OrgUnitId, Protocol, ProtocolId, ProtocolType, Stage};

pub use file::SnapshotFile;
pub use memory::{MemoryStore, Snapshot};
#[cfg(feature = "database")]
pub use sqlite::SqliteStore;

/// Selection criteria for listing protocols
#[derive(Debug, Clone, Default)]
pub struct ProtocolFilter {
    pub org_unit: Option<OrgUnitId>,
    pub protocol_type: Option<ProtocolType>,
    pub stage: Option<Stage>,
    pub number: Option<ProtocolNumber>,
    /// Skip completed, rejected and cancelled protocols
    pub open_only: bool,
    pub include_archived: bool,
}

impl ProtocolFilter {
    pub fn open() -> Self {
        Self {
            open_only: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, protocol: &Protocol) -> bool {
        if !self.include_archived && protocol.is_archived() {
            return false;
        }
        if self.open_only && protocol.is_terminal() {
            return false;
        }
        if self.org_unit.is_some_and(|org| org != protocol.org_unit) {
            return false;
        }
        if self.protocol_type.is_some_and(|t| t != protocol.protocol_type) {
            return false;
        }
        if self.stage.is_some_and(|s| s != protocol.stage) {
            return false;
        }
        if self.number.as_ref().is_some_and(|n| *n != protocol.number) {
            return false;
        }
        true
    }
}

/// Storage contract used by the executor.
///
/// Implementations must make `insert_protocol` and `commit_update` atomic:
/// either the protocol row and every audit entry are written, or nothing is.
/// Audit entries are never updated or removed.
#[async_trait]
pub trait ProtocolStore: Send + Sync {
    /// Insert a new protocol; fails with `DuplicateNumber` if its org-unit
    /// already uses the number
    async fn insert_protocol(&self, protocol: &Protocol, entries: &[AuditEntry]) -> Result<(), StoreError>;

    async fn get_protocol(&self, id: ProtocolId) -> Result<Option<Protocol>, StoreError>;

    /// Numbers are unique per org-unit only
    async fn find_by_number(
        &self,
        org_unit: OrgUnitId,
        number: &ProtocolNumber,
    ) -> Result<Option<Protocol>, StoreError>;

    /// Protocols of a type opened by an org-unit in a year, archived ones included
    async fn count_protocols(
        &self,
        org_unit: OrgUnitId,
        protocol_type: ProtocolType,
        year: i32,
    ) -> Result<u32, StoreError>;

    /// Replace a protocol if its stored version still equals `expected_version`
    async fn commit_update(
        &self,
        protocol: &Protocol,
        expected_version: i64,
        entries: &[AuditEntry],
    ) -> Result<(), StoreError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    /// Audit entries of a protocol in insertion order
    async fn audit_entries(&self, protocol_id: ProtocolId) -> Result<Vec<AuditEntry>, StoreError>;

    async fn list_protocols(&self, filter: &ProtocolFilter) -> Result<Vec<Protocol>, StoreError>;
}
