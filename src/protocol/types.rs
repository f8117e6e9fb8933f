// Core types for the protocol workflow

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::protocol::numbering::ProtocolNumber;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_type!(
    /// Identifier of a protocol record
    ProtocolId
);
id_type!(
    /// Identifier of an application user (requester, approver, actor)
    UserId
);
id_type!(
    /// Identifier of a member of the organization
    MemberId
);
id_type!(
    /// Identifier of an assembly (organizational unit)
    OrgUnitId
);

/// Kinds of protocol, each with its own workflow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolType {
    Initiation,
    Transfer,
    LeaveOfAbsence,
    Return,
    ComingOfAge,
    Dismissal,
    Honors,
    OfficerAssignment,
}

impl ProtocolType {
    pub const ALL: [ProtocolType; 8] = [
        ProtocolType::Initiation,
        ProtocolType::Transfer,
        ProtocolType::LeaveOfAbsence,
        ProtocolType::Return,
        ProtocolType::ComingOfAge,
        ProtocolType::Dismissal,
        ProtocolType::Honors,
        ProtocolType::OfficerAssignment,
    ];

    /// Prefix used in protocol numbers
    pub fn prefix(self) -> &'static str {
        match self {
            ProtocolType::Initiation => "INIC",
            ProtocolType::Transfer => "TRAN",
            ProtocolType::LeaveOfAbsence => "AFST",
            ProtocolType::Return => "RETO",
            ProtocolType::ComingOfAge => "MAIO",
            ProtocolType::Dismissal => "DESL",
            ProtocolType::Honors => "HONR",
            ProtocolType::OfficerAssignment => "CARG",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolType::Initiation => "initiation",
            ProtocolType::Transfer => "transfer",
            ProtocolType::LeaveOfAbsence => "leave_of_absence",
            ProtocolType::Return => "return",
            ProtocolType::ComingOfAge => "coming_of_age",
            ProtocolType::Dismissal => "dismissal",
            ProtocolType::Honors => "honors",
            ProtocolType::OfficerAssignment => "officer_assignment",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProtocolType::Initiation => "Iniciação",
            ProtocolType::Transfer => "Transferência",
            ProtocolType::LeaveOfAbsence => "Afastamento",
            ProtocolType::Return => "Retorno",
            ProtocolType::ComingOfAge => "Maioridade",
            ProtocolType::Dismissal => "Desligamento",
            ProtocolType::Honors => "Honrarias",
            ProtocolType::OfficerAssignment => "Nomeação de Cargo",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.prefix() == prefix)
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolType {
    type Err = String;

    /// Accepts the snake_case name, a kebab-case variant of it, or the number prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_").to_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized || t.prefix().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| s.to_string())
    }
}

/// Workflow stage (etapa) of a protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Creation,
    PendingApproval,
    FeeDefinition,
    AwaitingPayment,
    Ceremony,
    FinalApproval,
    Completed,
    Rejected,
    Cancelled,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Creation,
        Stage::PendingApproval,
        Stage::FeeDefinition,
        Stage::AwaitingPayment,
        Stage::Ceremony,
        Stage::FinalApproval,
        Stage::Completed,
        Stage::Rejected,
        Stage::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Rejected | Stage::Cancelled)
    }

    /// Stages from which a forward move counts as an approval
    pub fn is_approval_stage(self) -> bool {
        matches!(self, Stage::PendingApproval | Stage::FinalApproval)
    }

    /// Status a protocol has while sitting in this stage
    pub fn implied_status(self) -> ProtocolStatus {
        match self {
            Stage::Creation => ProtocolStatus::Draft,
            Stage::PendingApproval => ProtocolStatus::Pending,
            Stage::FeeDefinition | Stage::AwaitingPayment | Stage::Ceremony => {
                ProtocolStatus::UnderReview
            }
            Stage::FinalApproval => ProtocolStatus::Approved,
            Stage::Completed => ProtocolStatus::Completed,
            Stage::Rejected => ProtocolStatus::Rejected,
            Stage::Cancelled => ProtocolStatus::Cancelled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Creation => "creation",
            Stage::PendingApproval => "pending_approval",
            Stage::FeeDefinition => "fee_definition",
            Stage::AwaitingPayment => "awaiting_payment",
            Stage::Ceremony => "ceremony",
            Stage::FinalApproval => "final_approval",
            Stage::Completed => "completed",
            Stage::Rejected => "rejected",
            Stage::Cancelled => "cancelled",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Creation => "Criação",
            Stage::PendingApproval => "Aguardando Aprovação",
            Stage::FeeDefinition => "Definição de Taxa",
            Stage::AwaitingPayment => "Aguardando Pagamento",
            Stage::Ceremony => "Cerimônia",
            Stage::FinalApproval => "Aprovação Final",
            Stage::Completed => "Concluído",
            Stage::Rejected => "Rejeitado",
            Stage::Cancelled => "Cancelado",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            Stage::Creation => "gray",
            Stage::PendingApproval | Stage::FinalApproval => "warning",
            Stage::FeeDefinition | Stage::AwaitingPayment => "info",
            Stage::Ceremony => "primary",
            Stage::Completed => "success",
            Stage::Rejected => "danger",
            Stage::Cancelled => "gray",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_").to_lowercase();
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| s.to_string())
    }
}

/// Coarse lifecycle status of a protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolStatus {
    Draft,
    Pending,
    UnderReview,
    Approved,
    Rejected,
    Completed,
    Cancelled,
    /// Completion was attempted but its validation failed
    ProcessingError,
}

impl ProtocolStatus {
    pub const ALL: [ProtocolStatus; 8] = [
        ProtocolStatus::Draft,
        ProtocolStatus::Pending,
        ProtocolStatus::UnderReview,
        ProtocolStatus::Approved,
        ProtocolStatus::Rejected,
        ProtocolStatus::Completed,
        ProtocolStatus::Cancelled,
        ProtocolStatus::ProcessingError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolStatus::Draft => "draft",
            ProtocolStatus::Pending => "pending",
            ProtocolStatus::UnderReview => "under_review",
            ProtocolStatus::Approved => "approved",
            ProtocolStatus::Rejected => "rejected",
            ProtocolStatus::Completed => "completed",
            ProtocolStatus::Cancelled => "cancelled",
            ProtocolStatus::ProcessingError => "processing_error",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProtocolStatus::Draft => "Rascunho",
            ProtocolStatus::Pending => "Pendente",
            ProtocolStatus::UnderReview => "Em Análise",
            ProtocolStatus::Approved => "Aprovado",
            ProtocolStatus::Rejected => "Rejeitado",
            ProtocolStatus::Completed => "Concluído",
            ProtocolStatus::Cancelled => "Cancelado",
            ProtocolStatus::ProcessingError => "Erro de Processamento",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            ProtocolStatus::Draft | ProtocolStatus::Cancelled => "gray",
            ProtocolStatus::Pending => "warning",
            ProtocolStatus::UnderReview => "info",
            ProtocolStatus::Approved | ProtocolStatus::Completed => "success",
            ProtocolStatus::Rejected | ProtocolStatus::ProcessingError => "danger",
        }
    }
}

impl fmt::Display for ProtocolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_").to_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| s.to_string())
    }
}

/// Who is performing an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    User(UserId),
    /// Scheduled sweeps and other unattended callers
    System,
}

impl Actor {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Actor::User(id) => Some(*id),
            Actor::System => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{id}"),
            Actor::System => f.write_str("system"),
        }
    }
}

/// A request moving through an approval workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    pub id: ProtocolId,
    pub number: ProtocolNumber,
    pub protocol_type: ProtocolType,
    pub title: String,
    pub description: Option<String>,
    pub status: ProtocolStatus,
    pub stage: Stage,
    /// Workflow stages captured when the protocol was created
    pub steps: Vec<Stage>,
    pub requester: UserId,
    pub approver: Option<UserId>,
    pub org_unit: OrgUnitId,
    pub member: Option<MemberId>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub fee: Option<Decimal>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rejection_feedback: Option<String>,
    pub stage_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Protocol {
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn is_archived(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn year(&self) -> i32 {
        self.created_at.year()
    }

    /// Stage following the current one in the captured workflow
    pub fn next_stage(&self) -> Option<Stage> {
        let position = self.steps.iter().position(|s| *s == self.stage)?;
        self.steps.get(position + 1).copied()
    }

    /// Last stage before completion in the captured workflow
    pub fn closing_stage(&self) -> Option<Stage> {
        let completed = self.steps.iter().position(|s| *s == Stage::Completed)?;
        completed.checked_sub(1).and_then(|i| self.steps.get(i).copied())
    }

    /// Status and stage agree with the workflow definition
    pub fn is_consistent(&self) -> bool {
        let stage_known = self.stage.is_terminal() && self.stage != Stage::Completed
            || self.steps.contains(&self.stage);
        if !stage_known {
            return false;
        }
        if self.status == ProtocolStatus::ProcessingError {
            return self.closing_stage() == Some(self.stage);
        }
        self.status == self.stage.implied_status()
    }

    pub fn payload_value(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// Input for opening a protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProtocol {
    pub protocol_type: ProtocolType,
    pub title: String,
    pub description: Option<String>,
    pub org_unit: OrgUnitId,
    pub requester: UserId,
    pub approver: Option<UserId>,
    pub member: Option<MemberId>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl NewProtocol {
    pub fn new(protocol_type: ProtocolType, title: impl Into<String>, org_unit: OrgUnitId, requester: UserId) -> Self {
        Self {
            protocol_type,
            title: title.into(),
            description: None,
            org_unit,
            requester,
            approver: None,
            member: None,
            payload: Map::new(),
        }
    }

    pub fn with_member(mut self, member: MemberId) -> Self {
        self.member = Some(member);
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Member of the organization, subject of protocols
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub org_unit: OrgUnitId,
    pub name: String,
    pub national_id: String,
    pub active: bool,
    pub maturity_reached: bool,
    pub maturity_date: Option<chrono::NaiveDate>,
    pub birth_date: Option<chrono::NaiveDate>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Candidate record carried by an initiation protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMember {
    pub org_unit: OrgUnitId,
    pub name: String,
    pub national_id: String,
    pub birth_date: Option<chrono::NaiveDate>,
    pub email: Option<String>,
}

/// Strip punctuation from a national id so that formatted and raw values compare equal
pub fn normalize_national_id(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_stage_round_trips_through_its_name() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>(), Ok(stage));
        }
        assert_eq!("pending-approval".parse::<Stage>(), Ok(Stage::PendingApproval));
        assert!("ceremony_hall".parse::<Stage>().is_err());
    }

    #[test]
    fn test_protocol_type_accepts_prefix() {
        assert_eq!("AFST".parse::<ProtocolType>(), Ok(ProtocolType::LeaveOfAbsence));
        assert_eq!("coming-of-age".parse::<ProtocolType>(), Ok(ProtocolType::ComingOfAge));
        assert_eq!(ProtocolType::from_prefix("INIC"), Some(ProtocolType::Initiation));
        assert!("promotion".parse::<ProtocolType>().is_err());
    }

    #[test]
    fn test_terminal_stages() {
        let terminal: Vec<Stage> = Stage::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![Stage::Completed, Stage::Rejected, Stage::Cancelled]);
    }

    #[test]
    fn test_terminal_stages_imply_matching_status() {
        assert_eq!(Stage::Completed.implied_status(), ProtocolStatus::Completed);
        assert_eq!(Stage::Rejected.implied_status(), ProtocolStatus::Rejected);
        assert_eq!(Stage::Cancelled.implied_status(), ProtocolStatus::Cancelled);
    }

    #[test]
    fn test_normalize_national_id() {
        assert_eq!(normalize_national_id("123.456.789-09"), "12345678909");
        assert_eq!(normalize_national_id(" 12345678909 "), "12345678909");
    }

    #[test]
    fn test_actor_display() {
        assert_eq!(Actor::System.to_string(), "system");
        let id = UserId(Uuid::nil());
        assert_eq!(Actor::User(id).to_string(), format!("user:{}", Uuid::nil()));
    }
}
