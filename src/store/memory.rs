use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::audit::AuditEntry;
use crate::error::StoreError;
use crate::protocol::effects::MemberDirectory;
use crate::protocol::numbering::ProtocolNumber;
use crate::protocol::types::{
    normalize_national_id, Member, MemberId, NewMember, OrgUnitId, Protocol, ProtocolId,
    ProtocolType,
};
use crate::store::{ProtocolFilter, ProtocolStore};

/// Serializable copy of everything a `MemoryStore` holds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub protocols: Vec<Protocol>,
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
    #[serde(default)]
    pub members: Vec<Member>,
}

#[derive(Debug, Default)]
struct State {
    protocols: HashMap<ProtocolId, Protocol>,
    numbers: HashMap<(OrgUnitId, ProtocolNumber), ProtocolId>,
    audit: Vec<AuditEntry>,
    members: HashMap<MemberId, Member>,
}

/// In-process store; every operation takes a single lock so multi-row writes
/// are atomic
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, StoreError> {
        let mut state = State::default();
        for protocol in snapshot.protocols {
            if state
                .numbers
                .insert((protocol.org_unit, protocol.number.clone()), protocol.id)
                .is_some()
            {
                return Err(StoreError::DuplicateNumber(protocol.number.to_string()));
            }
            state.protocols.insert(protocol.id, protocol);
        }
        state.audit = snapshot.audit;
        state.members = snapshot.members.into_iter().map(|m| (m.id, m)).collect();
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.read().await;
        let mut protocols: Vec<Protocol> = state.protocols.values().cloned().collect();
        protocols.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.number.cmp(&b.number)));
        let mut members: Vec<Member> = state.members.values().cloned().collect();
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Snapshot {
            protocols,
            audit: state.audit.clone(),
            members,
        }
    }

    /// Insert a member directly, bypassing initiation
    pub async fn insert_member(&self, member: Member) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let national_id = normalize_national_id(&member.national_id);
        if state
            .members
            .values()
            .any(|m| normalize_national_id(&m.national_id) == national_id)
        {
            return Err(StoreError::DuplicateMember(member.national_id));
        }
        state.members.insert(member.id, member);
        Ok(())
    }
}

#[async_trait]
impl ProtocolStore for MemoryStore {
    async fn insert_protocol(&self, protocol: &Protocol, entries: &[AuditEntry]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let key = (protocol.org_unit, protocol.number.clone());
        if state.numbers.contains_key(&key) {
            return Err(StoreError::DuplicateNumber(protocol.number.to_string()));
        }
        state.numbers.insert(key, protocol.id);
        state.protocols.insert(protocol.id, protocol.clone());
        state.audit.extend_from_slice(entries);
        Ok(())
    }

    async fn get_protocol(&self, id: ProtocolId) -> Result<Option<Protocol>, StoreError> {
        Ok(self.state.read().await.protocols.get(&id).cloned())
    }

    async fn find_by_number(
        &self,
        org_unit: OrgUnitId,
        number: &ProtocolNumber,
    ) -> Result<Option<Protocol>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .numbers
            .get(&(org_unit, number.clone()))
            .and_then(|id| state.protocols.get(id))
            .cloned())
    }

    async fn count_protocols(
        &self,
        org_unit: OrgUnitId,
        protocol_type: ProtocolType,
        year: i32,
    ) -> Result<u32, StoreError> {
        let state = self.state.read().await;
        let count = state
            .protocols
            .values()
            .filter(|p| {
                p.org_unit == org_unit && p.protocol_type == protocol_type && p.number.year() == year
            })
            .count();
        Ok(count as u32)
    }

    async fn commit_update(
        &self,
        protocol: &Protocol,
        expected_version: i64,
        entries: &[AuditEntry],
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .protocols
            .get_mut(&protocol.id)
            .ok_or(StoreError::NotFound(protocol.id.0))?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: protocol.id.0,
                expected: expected_version,
                found: stored.version,
            });
        }
        *stored = protocol.clone();
        state.audit.extend_from_slice(entries);
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.protocols.contains_key(&entry.protocol_id) {
            return Err(StoreError::NotFound(entry.protocol_id.0));
        }
        state.audit.push(entry.clone());
        Ok(())
    }

    async fn audit_entries(&self, protocol_id: ProtocolId) -> Result<Vec<AuditEntry>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .iter()
            .filter(|e| e.protocol_id == protocol_id)
            .cloned()
            .collect())
    }

    async fn list_protocols(&self, filter: &ProtocolFilter) -> Result<Vec<Protocol>, StoreError> {
        let state = self.state.read().await;
        let mut protocols: Vec<Protocol> = state
            .protocols
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        protocols.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.number.cmp(&b.number)));
        Ok(protocols)
    }
}

#[async_trait]
impl MemberDirectory for MemoryStore {
    async fn get_member(&self, id: MemberId) -> Result<Option<Member>, StoreError> {
        Ok(self.state.read().await.members.get(&id).cloned())
    }

    async fn set_member_active(&self, id: MemberId, active: bool) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let member = state.members.get_mut(&id).ok_or(StoreError::NotFound(id.0))?;
        if member.active == active {
            return Ok(false);
        }
        member.active = active;
        Ok(true)
    }

    async fn mark_maturity(&self, id: MemberId, date: NaiveDate) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let member = state.members.get_mut(&id).ok_or(StoreError::NotFound(id.0))?;
        if member.maturity_reached {
            return Ok(false);
        }
        member.maturity_reached = true;
        member.maturity_date = Some(date);
        Ok(true)
    }

    async fn find_by_national_ids(&self, national_ids: &[String]) -> Result<Vec<Member>, StoreError> {
        let wanted: HashSet<String> = national_ids.iter().map(|n| normalize_national_id(n)).collect();
        let state = self.state.read().await;
        Ok(state
            .members
            .values()
            .filter(|m| wanted.contains(&normalize_national_id(&m.national_id)))
            .cloned()
            .collect())
    }

    async fn create_members(&self, members: &[NewMember]) -> Result<Vec<Member>, StoreError> {
        let mut state = self.state.write().await;
        let mut taken: HashSet<String> = state
            .members
            .values()
            .map(|m| normalize_national_id(&m.national_id))
            .collect();
        for candidate in members {
            if !taken.insert(normalize_national_id(&candidate.national_id)) {
                return Err(StoreError::DuplicateMember(candidate.national_id.clone()));
            }
        }

        let now = Utc::now();
        let created: Vec<Member> = members
            .iter()
            .map(|candidate| Member {
                id: MemberId::new(),
                org_unit: candidate.org_unit,
                name: candidate.name.clone(),
                national_id: normalize_national_id(&candidate.national_id),
                active: true,
                maturity_reached: false,
                maturity_date: None,
                birth_date: candidate.birth_date,
                email: candidate.email.clone(),
                created_at: now,
            })
            .collect();
        for member in &created {
            state.members.insert(member.id, member.clone());
        }
        Ok(created)
    }

    async fn list_members(&self, org_unit: Option<OrgUnitId>) -> Result<Vec<Member>, StoreError> {
        let state = self.state.read().await;
        let mut members: Vec<Member> = state
            .members
            .values()
            .filter(|m| org_unit.is_none_or(|org| m.org_unit == org))
            .cloned()
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::ProtocolType;

    fn candidate(name: &str, national_id: &str) -> NewMember {
        NewMember {
            org_unit: OrgUnitId::new(),
            name: name.to_string(),
            national_id: national_id.to_string(),
            birth_date: None,
            email: None,
        }
    }

    #[tokio::test]
    async fn test_create_members_is_all_or_nothing() {
        let store = MemoryStore::new();
        let result = store
            .create_members(&[
                candidate("Ana", "111.111.111-11"),
                candidate("Bruno", "22222222222"),
                candidate("Carla", "11111111111"),
            ])
            .await;
        assert!(matches!(result, Err(StoreError::DuplicateMember(_))));
        assert!(store.list_members(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_member_active_reports_change_once() {
        let store = MemoryStore::new();
        let created = store.create_members(&[candidate("Ana", "1")]).await.unwrap();
        let id = created[0].id;
        assert!(store.set_member_active(id, false).await.unwrap());
        assert!(!store.set_member_active(id, false).await.unwrap());
        assert!(!store.get_member(id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_append_audit_requires_existing_protocol() {
        let store = MemoryStore::new();
        let entry = crate::audit::AuditRecord::new(crate::audit::AuditAction::Edit, "orphan");
        let protocol = crate::protocol::mocks::sample_protocol(ProtocolType::Honors);
        let result = store.append_audit(&entry.into_entry(&protocol, None)).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_keeps_numbers_unique() {
        let store = MemoryStore::new();
        let protocol = crate::protocol::mocks::sample_protocol(ProtocolType::Honors);
        store.insert_protocol(&protocol, &[]).await.unwrap();
        let snapshot = store.snapshot().await;

        let restored = MemoryStore::from_snapshot(snapshot.clone()).unwrap();
        assert_eq!(
            restored
                .find_by_number(protocol.org_unit, &protocol.number)
                .await
                .unwrap()
                .map(|p| p.id),
            Some(protocol.id)
        );

        let mut doubled = snapshot;
        let mut copy = protocol.clone();
        copy.id = ProtocolId::new();
        doubled.protocols.push(copy);
        assert!(matches!(
            MemoryStore::from_snapshot(doubled),
            Err(StoreError::DuplicateNumber(_))
        ));
    }

    #[tokio::test]
    async fn test_same_number_in_two_org_units() {
        let store = MemoryStore::new();
        let first = crate::protocol::mocks::sample_protocol(ProtocolType::Transfer);
        let mut second = crate::protocol::mocks::sample_protocol(ProtocolType::Transfer);
        second.number = first.number.clone();
        store.insert_protocol(&first, &[]).await.unwrap();
        store.insert_protocol(&second, &[]).await.unwrap();

        let found = store.find_by_number(second.org_unit, &first.number).await.unwrap();
        assert_eq!(found.map(|p| p.id), Some(second.id));

        let mut twin = crate::protocol::mocks::sample_protocol(ProtocolType::Transfer);
        twin.number = first.number.clone();
        twin.org_unit = first.org_unit;
        assert!(matches!(
            store.insert_protocol(&twin, &[]).await,
            Err(StoreError::DuplicateNumber(_))
        ));
    }
}
