// Test doubles and fixtures - no persistence, no side effects

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::StoreError;
use crate::protocol::effects::MemberDirectory;
use crate::protocol::notify::{Notifier, TransitionEvent};
use crate::protocol::numbering::ProtocolNumber;
use crate::protocol::types::*;
use crate::protocol::workflow::WorkflowRegistry;

static NEXT_SEQUENCE: AtomicU32 = AtomicU32::new(1);

/// A draft protocol with the built-in workflow and a number no other fixture uses
pub fn sample_protocol(protocol_type: ProtocolType) -> Protocol {
    let now = Utc::now();
    let steps = WorkflowRegistry::builtin()
        .all_steps(protocol_type)
        .unwrap_or_else(|_| vec![Stage::Creation, Stage::Completed]);
    let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    Protocol {
        id: ProtocolId::new(),
        number: ProtocolNumber::new(protocol_type, now.year(), sequence),
        protocol_type,
        title: format!("{} de teste", protocol_type.label()),
        description: None,
        status: ProtocolStatus::Draft,
        stage: steps[0],
        steps,
        requester: UserId::new(),
        approver: None,
        org_unit: OrgUnitId::new(),
        member: None,
        payload: Default::default(),
        fee: None,
        submitted_at: None,
        approved_at: None,
        completed_at: None,
        rejection_feedback: None,
        stage_changed_at: now,
        created_at: now,
        updated_at: now,
        deleted_at: None,
        version: 1,
    }
}

pub fn sample_member() -> Member {
    let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    Member {
        id: MemberId::new(),
        org_unit: OrgUnitId::new(),
        name: format!("Membro {sequence}"),
        national_id: format!("{sequence:011}"),
        active: true,
        maturity_reached: false,
        maturity_date: None,
        birth_date: None,
        email: None,
        created_at: Utc::now(),
    }
}

/// In-memory member directory that records every mutating call
#[derive(Debug, Default)]
pub struct RecordingDirectory {
    members: Mutex<HashMap<MemberId, Member>>,
    calls: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
}

impl RecordingDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, member: Member) {
        self.members.lock().unwrap().insert(member.id, member);
    }

    pub fn member(&self, id: MemberId) -> Option<Member> {
        self.members.lock().unwrap().get(&id).cloned()
    }

    /// Make every following mutation fail with this message
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls that actually turned the member inactive
    pub fn deactivations(&self, id: MemberId) -> usize {
        let needle = format!("deactivate {id}");
        self.calls().iter().filter(|c| **c == needle).count()
    }

    fn check_failure(&self) -> Result<(), StoreError> {
        match self.failure.lock().unwrap().as_ref() {
            Some(message) => Err(StoreError::Corrupt(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MemberDirectory for RecordingDirectory {
    async fn get_member(&self, id: MemberId) -> Result<Option<Member>, StoreError> {
        Ok(self.member(id))
    }

    async fn set_member_active(&self, id: MemberId, active: bool) -> Result<bool, StoreError> {
        self.check_failure()?;
        let mut members = self.members.lock().unwrap();
        let member = members.get_mut(&id).ok_or(StoreError::NotFound(id.0))?;
        if member.active == active {
            return Ok(false);
        }
        member.active = active;
        let verb = if active { "activate" } else { "deactivate" };
        self.calls.lock().unwrap().push(format!("{verb} {id}"));
        Ok(true)
    }

    async fn mark_maturity(&self, id: MemberId, date: NaiveDate) -> Result<bool, StoreError> {
        self.check_failure()?;
        let mut members = self.members.lock().unwrap();
        let member = members.get_mut(&id).ok_or(StoreError::NotFound(id.0))?;
        if member.maturity_reached {
            return Ok(false);
        }
        member.maturity_reached = true;
        member.maturity_date = Some(date);
        self.calls.lock().unwrap().push(format!("maturity {id}"));
        Ok(true)
    }

    async fn find_by_national_ids(&self, national_ids: &[String]) -> Result<Vec<Member>, StoreError> {
        let wanted: Vec<String> = national_ids.iter().map(|n| normalize_national_id(n)).collect();
        Ok(self
            .members
            .lock()
            .unwrap()
            .values()
            .filter(|m| wanted.contains(&normalize_national_id(&m.national_id)))
            .cloned()
            .collect())
    }

    async fn create_members(&self, candidates: &[NewMember]) -> Result<Vec<Member>, StoreError> {
        self.check_failure()?;
        let mut members = self.members.lock().unwrap();
        let mut created = Vec::new();
        for candidate in candidates {
            let national_id = normalize_national_id(&candidate.national_id);
            let taken = members
                .values()
                .chain(created.iter())
                .any(|m: &Member| m.national_id == national_id);
            if taken {
                return Err(StoreError::DuplicateMember(national_id));
            }
            created.push(Member {
                id: MemberId::new(),
                org_unit: candidate.org_unit,
                name: candidate.name.clone(),
                national_id,
                active: true,
                maturity_reached: false,
                maturity_date: None,
                birth_date: candidate.birth_date,
                email: candidate.email.clone(),
                created_at: Utc::now(),
            });
        }
        for member in &created {
            members.insert(member.id, member.clone());
        }
        self.calls
            .lock()
            .unwrap()
            .push(format!("create {}", created.len()));
        Ok(created)
    }

    async fn list_members(&self, org_unit: Option<OrgUnitId>) -> Result<Vec<Member>, StoreError> {
        Ok(self
            .members
            .lock()
            .unwrap()
            .values()
            .filter(|m| org_unit.is_none_or(|org| m.org_unit == org))
            .cloned()
            .collect())
    }
}

/// Notifier that keeps every event it receives
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<TransitionEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransitionEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn transition_succeeded(&self, event: &TransitionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
