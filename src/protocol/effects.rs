// Completion side effects, keyed by protocol type.
//
// Handlers run in two phases. `prepare` validates before the Completed stage
// is committed and may block completion. `apply` runs after the commit; its
// failures are recorded in the audit trail and never undo the stage change.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{StoreError, WorkflowError};
use crate::protocol::types::{
    normalize_national_id, Member, MemberId, NewMember, OrgUnitId, Protocol, ProtocolType,
};

/// Member records touched by completion handlers
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn get_member(&self, id: MemberId) -> Result<Option<Member>, StoreError>;

    /// Returns whether the flag actually changed
    async fn set_member_active(&self, id: MemberId, active: bool) -> Result<bool, StoreError>;

    /// Returns whether the member was not already marked
    async fn mark_maturity(&self, id: MemberId, date: NaiveDate) -> Result<bool, StoreError>;

    /// Members whose normalized national id is in the list
    async fn find_by_national_ids(&self, national_ids: &[String]) -> Result<Vec<Member>, StoreError>;

    /// Create every member or none; a taken national id fails with `DuplicateMember`
    async fn create_members(&self, members: &[NewMember]) -> Result<Vec<Member>, StoreError>;

    async fn list_members(&self, org_unit: Option<OrgUnitId>) -> Result<Vec<Member>, StoreError>;
}

/// What happened when completion effects were dispatched
#[derive(Debug, Clone)]
pub enum SideEffectReport {
    Applied { summary: String },
    /// A previous dispatch already recorded completion
    AlreadyApplied,
    /// No handler is registered for the protocol type
    Skipped,
    /// The stage change stands; the failure is in the audit trail
    Failed { error: Arc<WorkflowError> },
}

impl SideEffectReport {
    pub fn is_failure(&self) -> bool {
        matches!(self, SideEffectReport::Failed { .. })
    }

    /// The `SideEffect` error of a failed dispatch
    pub fn error(&self) -> Option<&WorkflowError> {
        match self {
            SideEffectReport::Failed { error } => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for SideEffectReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SideEffectReport::Applied { summary } => write!(f, "applied: {summary}"),
            SideEffectReport::AlreadyApplied => f.write_str("already applied"),
            SideEffectReport::Skipped => f.write_str("no side effects"),
            SideEffectReport::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

#[async_trait]
pub trait CompletionHandler: Send + Sync {
    fn protocol_type(&self) -> ProtocolType;

    /// Validation run before completion is committed
    async fn prepare(&self, _protocol: &Protocol, _directory: &dyn MemberDirectory) -> Result<(), Vec<String>> {
        Ok(())
    }

    /// Apply the effect, returning a short summary for the audit trail
    async fn apply(&self, protocol: &Protocol, directory: &dyn MemberDirectory) -> anyhow::Result<String>;
}

/// Registered handlers
#[derive(Clone, Default)]
pub struct CompletionEffects {
    handlers: HashMap<ProtocolType, Arc<dyn CompletionHandler>>,
}

impl CompletionEffects {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut effects = Self::empty();
        effects.register(Arc::new(LeaveOfAbsenceHandler));
        effects.register(Arc::new(ComingOfAgeHandler));
        effects.register(Arc::new(InitiationHandler));
        effects.register(Arc::new(ReturnHandler));
        effects
    }

    pub fn register(&mut self, handler: Arc<dyn CompletionHandler>) {
        self.handlers.insert(handler.protocol_type(), handler);
    }

    pub fn handler(&self, protocol_type: ProtocolType) -> Option<&Arc<dyn CompletionHandler>> {
        self.handlers.get(&protocol_type)
    }
}

impl fmt::Debug for CompletionEffects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("CompletionEffects").field("handlers", &types).finish()
    }
}

fn required_member(protocol: &Protocol) -> anyhow::Result<MemberId> {
    protocol
        .member
        .ok_or_else(|| anyhow!("protocol {} does not reference a member", protocol.number))
}

/// The referenced member must exist before completion is committed
async fn member_on_record(protocol: &Protocol, directory: &dyn MemberDirectory) -> Result<(), Vec<String>> {
    let member = required_member(protocol).map_err(|e| vec![e.to_string()])?;
    match directory.get_member(member).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(vec![format!("member {member} not found")]),
        Err(e) => Err(vec![format!("could not look up member {member}: {e}")]),
    }
}

/// Deactivates the member on approved leave
pub struct LeaveOfAbsenceHandler;

#[async_trait]
impl CompletionHandler for LeaveOfAbsenceHandler {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::LeaveOfAbsence
    }

    async fn prepare(&self, protocol: &Protocol, directory: &dyn MemberDirectory) -> Result<(), Vec<String>> {
        member_on_record(protocol, directory).await
    }

    async fn apply(&self, protocol: &Protocol, directory: &dyn MemberDirectory) -> anyhow::Result<String> {
        let member = required_member(protocol)?;
        let changed = directory.set_member_active(member, false).await?;
        Ok(if changed {
            format!("member {member} deactivated")
        } else {
            format!("member {member} was already inactive")
        })
    }
}

/// Brings a member back from leave
pub struct ReturnHandler;

#[async_trait]
impl CompletionHandler for ReturnHandler {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Return
    }

    async fn prepare(&self, protocol: &Protocol, directory: &dyn MemberDirectory) -> Result<(), Vec<String>> {
        member_on_record(protocol, directory).await
    }

    async fn apply(&self, protocol: &Protocol, directory: &dyn MemberDirectory) -> anyhow::Result<String> {
        let member = required_member(protocol)?;
        let changed = directory.set_member_active(member, true).await?;
        Ok(if changed {
            format!("member {member} reactivated")
        } else {
            format!("member {member} was already active")
        })
    }
}

/// Marks maturity for the protocol's member and any listed in `payload.members`
pub struct ComingOfAgeHandler;

impl ComingOfAgeHandler {
    fn members(protocol: &Protocol) -> anyhow::Result<Vec<MemberId>> {
        let mut members: Vec<MemberId> = protocol.member.into_iter().collect();
        if let Some(listed) = protocol.payload_value("members") {
            let listed = listed
                .as_array()
                .ok_or_else(|| anyhow!("payload.members must be a list of member ids"))?;
            for value in listed {
                let raw = value
                    .as_str()
                    .ok_or_else(|| anyhow!("payload.members entries must be strings"))?;
                let id: MemberId = raw.parse().with_context(|| format!("invalid member id '{raw}'"))?;
                if !members.contains(&id) {
                    members.push(id);
                }
            }
        }
        if members.is_empty() {
            return Err(anyhow!("protocol {} does not reference any member", protocol.number));
        }
        Ok(members)
    }

    fn maturity_date(protocol: &Protocol) -> anyhow::Result<NaiveDate> {
        match protocol.payload_value("maturity_date").and_then(Value::as_str) {
            Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .with_context(|| format!("invalid maturity_date '{raw}'")),
            None => Ok(protocol.completed_at.unwrap_or_else(Utc::now).date_naive()),
        }
    }
}

#[async_trait]
impl CompletionHandler for ComingOfAgeHandler {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::ComingOfAge
    }

    async fn apply(&self, protocol: &Protocol, directory: &dyn MemberDirectory) -> anyhow::Result<String> {
        let members = Self::members(protocol)?;
        let date = Self::maturity_date(protocol)?;
        let mut marked = 0;
        for member in &members {
            if directory.mark_maturity(*member, date).await? {
                marked += 1;
            }
        }
        Ok(format!("maturity recorded for {marked} of {} member(s) on {date}", members.len()))
    }
}

/// Creates the member records for the candidates of an initiation
pub struct InitiationHandler;

impl InitiationHandler {
    /// Parse `payload.candidates`, collecting every problem instead of stopping at the first
    pub fn candidates(protocol: &Protocol) -> Result<Vec<NewMember>, Vec<String>> {
        let listed = match protocol.payload_value("candidates") {
            Some(Value::Array(listed)) if !listed.is_empty() => listed,
            Some(Value::Array(_)) | None => return Err(vec!["no candidates listed".to_string()]),
            Some(_) => return Err(vec!["candidates must be a list".to_string()]),
        };

        let mut errors = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut candidates = Vec::with_capacity(listed.len());

        for (index, value) in listed.iter().enumerate() {
            let position = index + 1;
            let Some(fields) = value.as_object() else {
                errors.push(format!("candidate {position}: expected an object"));
                continue;
            };
            let text = |key: &str| {
                fields
                    .get(key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
            };

            let name = text("name");
            if name.is_none() {
                errors.push(format!("candidate {position}: name is required"));
            }
            let national_id = text("national_id").map(normalize_national_id).filter(|n| !n.is_empty());
            match &national_id {
                None => errors.push(format!("candidate {position}: national_id is required")),
                Some(id) => {
                    if let Some(first) = seen.insert(id.clone(), position) {
                        errors.push(format!(
                            "candidate {position}: national_id {id} repeats candidate {first}"
                        ));
                    }
                }
            }
            let birth_date = match text("birth_date") {
                Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
                    Ok(date) => Some(date),
                    Err(_) => {
                        errors.push(format!("candidate {position}: invalid birth_date '{raw}'"));
                        None
                    }
                },
                None => None,
            };

            if let (Some(name), Some(national_id)) = (name, national_id) {
                candidates.push(NewMember {
                    org_unit: protocol.org_unit,
                    name: name.to_string(),
                    national_id,
                    birth_date,
                    email: text("email").map(str::to_string),
                });
            }
        }

        if errors.is_empty() {
            Ok(candidates)
        } else {
            Err(errors)
        }
    }
}

#[async_trait]
impl CompletionHandler for InitiationHandler {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Initiation
    }

    async fn prepare(&self, protocol: &Protocol, directory: &dyn MemberDirectory) -> Result<(), Vec<String>> {
        let candidates = Self::candidates(protocol)?;
        let ids: Vec<String> = candidates.iter().map(|c| c.national_id.clone()).collect();
        let existing = directory
            .find_by_national_ids(&ids)
            .await
            .map_err(|e| vec![format!("could not check existing members: {e}")])?;
        if existing.is_empty() {
            return Ok(());
        }
        let taken: HashSet<String> = existing
            .iter()
            .map(|m| normalize_national_id(&m.national_id))
            .collect();
        Err(candidates
            .iter()
            .filter(|c| taken.contains(&c.national_id))
            .map(|c| format!("national_id {} already belongs to a member", c.national_id))
            .collect())
    }

    async fn apply(&self, protocol: &Protocol, directory: &dyn MemberDirectory) -> anyhow::Result<String> {
        let candidates = Self::candidates(protocol).map_err(|errors| anyhow!(errors.join("; ")))?;
        let created = directory.create_members(&candidates).await?;
        Ok(format!("{} member(s) created", created.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mocks::{sample_member, sample_protocol, RecordingDirectory};
    use serde_json::json;

    fn initiation_with(candidates: Value) -> Protocol {
        let mut protocol = sample_protocol(ProtocolType::Initiation);
        protocol.payload.insert("candidates".to_string(), candidates);
        protocol
    }

    #[test]
    fn test_candidates_require_name_and_national_id() {
        let protocol = initiation_with(json!([
            { "name": "Ana", "national_id": "111.111.111-11" },
            { "name": "", "national_id": "222" },
            { "name": "Carla" },
        ]));
        let errors = InitiationHandler::candidates(&protocol).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("candidate 2: name"));
        assert!(errors[1].contains("candidate 3: national_id"));
    }

    #[test]
    fn test_candidates_detect_duplicates_after_normalization() {
        let protocol = initiation_with(json!([
            { "name": "Ana", "national_id": "111.111.111-11" },
            { "name": "Bia", "national_id": "11111111111" },
        ]));
        let errors = InitiationHandler::candidates(&protocol).unwrap_err();
        assert_eq!(errors, vec!["candidate 2: national_id 11111111111 repeats candidate 1".to_string()]);
    }

    #[test]
    fn test_missing_candidates() {
        let protocol = sample_protocol(ProtocolType::Initiation);
        assert!(InitiationHandler::candidates(&protocol).is_err());
        assert!(InitiationHandler::candidates(&initiation_with(json!([]))).is_err());
        assert!(InitiationHandler::candidates(&initiation_with(json!("Ana"))).is_err());
    }

    #[tokio::test]
    async fn test_prepare_rejects_existing_national_ids() {
        let directory = RecordingDirectory::new();
        let mut existing = sample_member();
        existing.national_id = "33333333333".to_string();
        directory.add(existing);

        let protocol = initiation_with(json!([
            { "name": "Ana", "national_id": "333.333.333-33" },
            { "name": "Bia", "national_id": "44444444444" },
        ]));
        let errors = InitiationHandler.prepare(&protocol, &directory).await.unwrap_err();
        assert_eq!(errors, vec!["national_id 33333333333 already belongs to a member".to_string()]);
    }

    #[tokio::test]
    async fn test_leave_of_absence_deactivates_once() {
        let directory = RecordingDirectory::new();
        let member = sample_member();
        let member_id = member.id;
        directory.add(member);

        let mut protocol = sample_protocol(ProtocolType::LeaveOfAbsence);
        protocol.member = Some(member_id);

        let first = LeaveOfAbsenceHandler.apply(&protocol, &directory).await.unwrap();
        let second = LeaveOfAbsenceHandler.apply(&protocol, &directory).await.unwrap();
        assert!(first.contains("deactivated"));
        assert!(second.contains("already inactive"));
        assert_eq!(directory.deactivations(member_id), 1);
    }

    #[tokio::test]
    async fn test_coming_of_age_marks_every_listed_member() {
        let directory = RecordingDirectory::new();
        let first = sample_member();
        let second = sample_member();
        let (first_id, second_id) = (first.id, second.id);
        directory.add(first);
        directory.add(second);

        let mut protocol = sample_protocol(ProtocolType::ComingOfAge);
        protocol.member = Some(first_id);
        protocol
            .payload
            .insert("members".to_string(), json!([second_id.to_string(), first_id.to_string()]));
        protocol
            .payload
            .insert("maturity_date".to_string(), json!("2025-03-21"));

        let summary = ComingOfAgeHandler.apply(&protocol, &directory).await.unwrap();
        assert!(summary.contains("2 of 2"));
        let date = NaiveDate::from_ymd_opt(2025, 3, 21);
        assert_eq!(directory.member(first_id).unwrap().maturity_date, date);
        assert_eq!(directory.member(second_id).unwrap().maturity_date, date);
    }

    #[tokio::test]
    async fn test_leave_without_member_fails() {
        let directory = RecordingDirectory::new();
        let protocol = sample_protocol(ProtocolType::LeaveOfAbsence);
        assert!(LeaveOfAbsenceHandler.apply(&protocol, &directory).await.is_err());

        let errors = LeaveOfAbsenceHandler.prepare(&protocol, &directory).await.unwrap_err();
        assert!(errors[0].contains("does not reference a member"));
    }

    #[tokio::test]
    async fn test_return_needs_a_known_member() {
        let directory = RecordingDirectory::new();
        let mut protocol = sample_protocol(ProtocolType::Return);
        protocol.member = Some(MemberId::new());
        let errors = ReturnHandler.prepare(&protocol, &directory).await.unwrap_err();
        assert!(errors[0].ends_with("not found"));

        let member = sample_member();
        protocol.member = Some(member.id);
        directory.add(member);
        assert!(ReturnHandler.prepare(&protocol, &directory).await.is_ok());
    }

    #[test]
    fn test_builtin_handlers() {
        let effects = CompletionEffects::builtin();
        assert!(effects.handler(ProtocolType::Initiation).is_some());
        assert!(effects.handler(ProtocolType::Return).is_some());
        assert!(effects.handler(ProtocolType::Honors).is_none());
    }
}
