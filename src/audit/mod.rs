// Audit trail (histórico) for protocols
//
// Entries are append-only: stores expose no way to update or delete them.

pub mod money;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::WorkflowResult;
use crate::protocol::types::{Protocol, ProtocolId, ProtocolStatus, Stage, UserId};
use crate::store::ProtocolStore;

pub use money::MoneyFormat;

/// Kind of action recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Creation,
    Edit,
    SubmitForApproval,
    Approval,
    Rejection,
    StageChange,
    StatusChange,
    FeeDefinition,
    Payment,
    Completion,
    Cancellation,
    MemberAdded,
    MemberRemoved,
    AttachmentAdded,
    AttachmentRemoved,
    ProcessingError,
    Archived,
}

impl AuditAction {
    pub const ALL: [AuditAction; 17] = [
        AuditAction::Creation,
        AuditAction::Edit,
        AuditAction::SubmitForApproval,
        AuditAction::Approval,
        AuditAction::Rejection,
        AuditAction::StageChange,
        AuditAction::StatusChange,
        AuditAction::FeeDefinition,
        AuditAction::Payment,
        AuditAction::Completion,
        AuditAction::Cancellation,
        AuditAction::MemberAdded,
        AuditAction::MemberRemoved,
        AuditAction::AttachmentAdded,
        AuditAction::AttachmentRemoved,
        AuditAction::ProcessingError,
        AuditAction::Archived,
    ];

    /// Action recorded when a protocol moves between two stages
    pub fn for_transition(from: Stage, to: Stage) -> Self {
        match (from, to) {
            (_, Stage::Rejected) => AuditAction::Rejection,
            (_, Stage::Cancelled) => AuditAction::Cancellation,
            (Stage::Creation, Stage::PendingApproval) => AuditAction::SubmitForApproval,
            (from, _) if from.is_approval_stage() => AuditAction::Approval,
            _ => AuditAction::StageChange,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Creation => "creation",
            AuditAction::Edit => "edit",
            AuditAction::SubmitForApproval => "submit_for_approval",
            AuditAction::Approval => "approval",
            AuditAction::Rejection => "rejection",
            AuditAction::StageChange => "stage_change",
            AuditAction::StatusChange => "status_change",
            AuditAction::FeeDefinition => "fee_definition",
            AuditAction::Payment => "payment",
            AuditAction::Completion => "completion",
            AuditAction::Cancellation => "cancellation",
            AuditAction::MemberAdded => "member_added",
            AuditAction::MemberRemoved => "member_removed",
            AuditAction::AttachmentAdded => "attachment_added",
            AuditAction::AttachmentRemoved => "attachment_removed",
            AuditAction::ProcessingError => "processing_error",
            AuditAction::Archived => "archived",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AuditAction::Creation => "Criação",
            AuditAction::Edit => "Edição",
            AuditAction::SubmitForApproval => "Enviado para Aprovação",
            AuditAction::Approval => "Aprovação",
            AuditAction::Rejection => "Rejeição",
            AuditAction::StageChange => "Mudança de Etapa",
            AuditAction::StatusChange => "Mudança de Status",
            AuditAction::FeeDefinition => "Definição de Taxa",
            AuditAction::Payment => "Pagamento",
            AuditAction::Completion => "Conclusão",
            AuditAction::Cancellation => "Cancelamento",
            AuditAction::MemberAdded => "Membro Adicionado",
            AuditAction::MemberRemoved => "Membro Removido",
            AuditAction::AttachmentAdded => "Anexo Adicionado",
            AuditAction::AttachmentRemoved => "Anexo Removido",
            AuditAction::ProcessingError => "Erro de Processamento",
            AuditAction::Archived => "Arquivado",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            AuditAction::Creation | AuditAction::Edit => "gray",
            AuditAction::SubmitForApproval | AuditAction::StageChange | AuditAction::StatusChange => {
                "info"
            }
            AuditAction::Approval | AuditAction::Completion | AuditAction::Payment => "success",
            AuditAction::Rejection | AuditAction::ProcessingError => "danger",
            AuditAction::FeeDefinition => "warning",
            AuditAction::Cancellation | AuditAction::Archived => "gray",
            AuditAction::MemberAdded
            | AuditAction::MemberRemoved
            | AuditAction::AttachmentAdded
            | AuditAction::AttachmentRemoved => "primary",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_").to_lowercase();
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == normalized)
            .ok_or_else(|| s.to_string())
    }
}

/// Tracked protocol fields on one side of an action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub status: Option<ProtocolStatus>,
    pub stage: Option<Stage>,
    pub data: Option<Value>,
}

impl StateSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of(protocol: &Protocol) -> Self {
        Self {
            status: Some(protocol.status),
            stage: Some(protocol.stage),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// One immutable row of the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub protocol_id: ProtocolId,
    /// Acting user; the requester when the action had no authenticated actor
    pub user: UserId,
    pub system_initiated: bool,
    pub action: AuditAction,
    pub description: String,
    pub comment: Option<String>,
    pub before: StateSnapshot,
    pub after: StateSnapshot,
    pub created_at: DateTime<Utc>,
}

/// Everything about an entry except who wrote it and for which protocol
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub action: AuditAction,
    pub description: String,
    pub comment: Option<String>,
    pub before: StateSnapshot,
    pub after: StateSnapshot,
}

impl AuditRecord {
    pub fn new(action: AuditAction, description: impl Into<String>) -> Self {
        Self {
            action,
            description: description.into(),
            comment: None,
            before: StateSnapshot::empty(),
            after: StateSnapshot::empty(),
        }
    }

    pub fn before(mut self, before: StateSnapshot) -> Self {
        self.before = before;
        self
    }

    pub fn after(mut self, after: StateSnapshot) -> Self {
        self.after = after;
        self
    }

    pub fn comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment.filter(|c| !c.trim().is_empty());
        self
    }

    /// Attribute the record; without an actor the protocol's requester is used
    pub fn into_entry(self, protocol: &Protocol, actor: Option<UserId>) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            protocol_id: protocol.id,
            user: actor.unwrap_or(protocol.requester),
            system_initiated: actor.is_none(),
            action: self.action,
            description: self.description,
            comment: self.comment,
            before: self.before,
            after: self.after,
            created_at: Utc::now(),
        }
    }
}

/// Ordered, restartable view over a protocol's audit trail
#[derive(Debug, Clone)]
pub struct Timeline {
    entries: Arc<[AuditEntry]>,
    newest_first: bool,
}

impl Timeline {
    pub fn new(mut entries: Vec<AuditEntry>, newest_first: bool) -> Self {
        // stable: entries written in the same instant keep insertion order
        entries.sort_by_key(|e| e.created_at);
        Self {
            entries: entries.into(),
            newest_first,
        }
    }

    pub fn iter(&self) -> TimelineIter<'_> {
        TimelineIter {
            inner: self.entries.iter(),
            newest_first: self.newest_first,
        }
    }

    pub fn by_action(&self, action: AuditAction) -> impl Iterator<Item = &AuditEntry> + '_ {
        self.iter().filter(move |e| e.action == action)
    }

    /// Entries created within `[start, end]`
    pub fn in_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Iterator<Item = &AuditEntry> + '_ {
        self.iter()
            .filter(move |e| e.created_at >= start && e.created_at <= end)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&AuditEntry> {
        self.entries.last()
    }
}

impl<'a> IntoIterator for &'a Timeline {
    type Item = &'a AuditEntry;
    type IntoIter = TimelineIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct TimelineIter<'a> {
    inner: std::slice::Iter<'a, AuditEntry>,
    newest_first: bool,
}

impl<'a> Iterator for TimelineIter<'a> {
    type Item = &'a AuditEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.newest_first {
            self.inner.next_back()
        } else {
            self.inner.next()
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Single entry point for writing and reading audit entries
pub struct AuditLogger<S: ProtocolStore + ?Sized> {
    store: Arc<S>,
    money: MoneyFormat,
}

impl<S: ProtocolStore + ?Sized> Clone for AuditLogger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            money: self.money.clone(),
        }
    }
}

impl<S: ProtocolStore + ?Sized> AuditLogger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            money: MoneyFormat::default(),
        }
    }

    pub fn with_money_format(mut self, money: MoneyFormat) -> Self {
        self.money = money;
        self
    }

    pub fn money(&self) -> &MoneyFormat {
        &self.money
    }

    /// Append one entry to the protocol's trail
    pub async fn log(
        &self,
        protocol: &Protocol,
        record: AuditRecord,
        actor: Option<UserId>,
    ) -> WorkflowResult<AuditEntry> {
        let entry = record.into_entry(protocol, actor);
        self.store.append_audit(&entry).await?;
        tracing::debug!(
            protocol.number = %protocol.number,
            action = %entry.action,
            user = %entry.user,
            "Audit entry written"
        );
        Ok(entry)
    }

    pub fn fee_definition_record(&self, protocol: &Protocol, amount: Decimal) -> AuditRecord {
        let previous = protocol.fee.map(|fee| self.money.format(fee));
        let description = match &previous {
            Some(previous) => format!(
                "Taxa alterada de {} para {}",
                previous,
                self.money.format(amount)
            ),
            None => format!("Taxa definida: {}", self.money.format(amount)),
        };
        AuditRecord::new(AuditAction::FeeDefinition, description)
            .before(StateSnapshot::of(protocol).with_data(serde_json::json!({ "fee": protocol.fee })))
            .after(StateSnapshot::of(protocol).with_data(serde_json::json!({ "fee": amount })))
    }

    pub fn payment_record(&self, protocol: &Protocol) -> AuditRecord {
        let description = match protocol.fee {
            Some(fee) => format!("Pagamento registrado: {}", self.money.format(fee)),
            None => "Pagamento registrado".to_string(),
        };
        AuditRecord::new(AuditAction::Payment, description)
            .before(StateSnapshot::of(protocol))
            .after(StateSnapshot::of(protocol))
    }

    pub async fn log_attachment_added(
        &self,
        protocol: &Protocol,
        file_name: &str,
        actor: Option<UserId>,
    ) -> WorkflowResult<AuditEntry> {
        let record = AuditRecord::new(
            AuditAction::AttachmentAdded,
            format!("Anexo adicionado: {file_name}"),
        )
        .after(StateSnapshot::empty().with_data(serde_json::json!({ "file": file_name })));
        self.log(protocol, record, actor).await
    }

    pub async fn log_attachment_removed(
        &self,
        protocol: &Protocol,
        file_name: &str,
        actor: Option<UserId>,
    ) -> WorkflowResult<AuditEntry> {
        let record = AuditRecord::new(
            AuditAction::AttachmentRemoved,
            format!("Anexo removido: {file_name}"),
        )
        .before(StateSnapshot::empty().with_data(serde_json::json!({ "file": file_name })));
        self.log(protocol, record, actor).await
    }

    pub async fn log_processing_error(
        &self,
        protocol: &Protocol,
        detail: &str,
        errors: Vec<String>,
    ) -> WorkflowResult<AuditEntry> {
        let record = AuditRecord::new(
            AuditAction::ProcessingError,
            format!("Erro ao processar conclusão: {detail}"),
        )
        .before(StateSnapshot::of(protocol))
        .after(StateSnapshot::of(protocol).with_data(serde_json::json!({
            "error": detail,
            "details": errors,
        })));
        self.log(protocol, record, None).await
    }

    pub async fn timeline(&self, protocol_id: ProtocolId, newest_first: bool) -> WorkflowResult<Timeline> {
        let entries = self.store.audit_entries(protocol_id).await?;
        Ok(Timeline::new(entries, newest_first))
    }

    pub async fn logs_by_action(
        &self,
        protocol_id: ProtocolId,
        action: AuditAction,
    ) -> WorkflowResult<Vec<AuditEntry>> {
        let timeline = self.timeline(protocol_id, false).await?;
        Ok(timeline.by_action(action).cloned().collect())
    }

    pub async fn logs_by_period(
        &self,
        protocol_id: ProtocolId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> WorkflowResult<Vec<AuditEntry>> {
        let timeline = self.timeline(protocol_id, false).await?;
        Ok(timeline.in_period(start, end).cloned().collect())
    }

    pub async fn has_action(&self, protocol_id: ProtocolId, action: AuditAction) -> WorkflowResult<bool> {
        let timeline = self.timeline(protocol_id, false).await?;
        let found = timeline.by_action(action).next().is_some();
        Ok(found)
    }
}
