// Capability-based authorization injected into the executor

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::protocol::types::{OrgUnitId, Stage, UserId};

/// Something an actor may be allowed to do with protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CreateProtocol,
    Submit,
    Approve,
    DefineFee,
    RegisterPayment,
    Complete,
    Reject,
    Cancel,
    Edit,
    Archive,
    ViewHistory,
}

impl Capability {
    pub const ALL: [Capability; 11] = [
        Capability::CreateProtocol,
        Capability::Submit,
        Capability::Approve,
        Capability::DefineFee,
        Capability::RegisterPayment,
        Capability::Complete,
        Capability::Reject,
        Capability::Cancel,
        Capability::Edit,
        Capability::Archive,
        Capability::ViewHistory,
    ];

    /// Capability needed to move a protocol from `from` to `to`
    pub fn for_transition(from: Stage, to: Stage) -> Self {
        match to {
            Stage::Rejected => return Capability::Reject,
            Stage::Cancelled => return Capability::Cancel,
            _ => {}
        }
        match from {
            Stage::Creation => Capability::Submit,
            Stage::PendingApproval | Stage::FinalApproval => Capability::Approve,
            Stage::FeeDefinition => Capability::DefineFee,
            Stage::AwaitingPayment => Capability::RegisterPayment,
            Stage::Ceremony | Stage::Completed | Stage::Rejected | Stage::Cancelled => {
                Capability::Complete
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::CreateProtocol => "create_protocol",
            Capability::Submit => "submit",
            Capability::Approve => "approve",
            Capability::DefineFee => "define_fee",
            Capability::RegisterPayment => "register_payment",
            Capability::Complete => "complete",
            Capability::Reject => "reject",
            Capability::Cancel => "cancel",
            Capability::Edit => "edit",
            Capability::Archive => "archive",
            Capability::ViewHistory => "view_history",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether a user may exercise a capability within an org-unit
#[cfg_attr(test, mockall::automock)]
pub trait Authorizer: Send + Sync {
    fn authorize(&self, user: UserId, capability: Capability, org_unit: OrgUnitId) -> bool;
}

/// Grants everything; used by the CLI, where the operator is trusted
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _user: UserId, _capability: Capability, _org_unit: OrgUnitId) -> bool {
        true
    }
}

/// Roles a user can hold within an org-unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Secretary,
    Treasurer,
    Presiding,
    Member,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "secretary" => Ok(Role::Secretary),
            "treasurer" => Ok(Role::Treasurer),
            "presiding" => Ok(Role::Presiding),
            "member" => Ok(Role::Member),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Source of role assignments
pub trait RoleLookup: Send + Sync {
    fn roles(&self, user: UserId, org_unit: OrgUnitId) -> Vec<Role>;
}

/// Fixed role assignments
#[derive(Debug, Clone, Default)]
pub struct StaticRoles {
    grants: HashMap<(UserId, OrgUnitId), Vec<Role>>,
}

impl StaticRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, user: UserId, org_unit: OrgUnitId, role: Role) -> Self {
        self.grants.entry((user, org_unit)).or_default().push(role);
        self
    }
}

impl RoleLookup for StaticRoles {
    fn roles(&self, user: UserId, org_unit: OrgUnitId) -> Vec<Role> {
        self.grants.get(&(user, org_unit)).cloned().unwrap_or_default()
    }
}

/// Maps roles to capabilities through a policy table
pub struct RoleAuthorizer<L: RoleLookup> {
    lookup: L,
    policy: HashMap<Role, HashSet<Capability>>,
}

impl<L: RoleLookup> RoleAuthorizer<L> {
    pub fn new(lookup: L) -> Self {
        use Capability::*;

        let policy = HashMap::from([
            (Role::Admin, Capability::ALL.into_iter().collect()),
            (
                Role::Secretary,
                HashSet::from([CreateProtocol, Submit, Edit, Cancel, Archive, ViewHistory]),
            ),
            (Role::Treasurer, HashSet::from([DefineFee, RegisterPayment, ViewHistory])),
            (Role::Presiding, HashSet::from([Approve, Reject, Complete, ViewHistory])),
            (Role::Member, HashSet::from([ViewHistory])),
        ]);

        Self { lookup, policy }
    }

    pub fn with_grant(mut self, role: Role, capability: Capability) -> Self {
        self.policy.entry(role).or_default().insert(capability);
        self
    }
}

impl<L: RoleLookup> Authorizer for RoleAuthorizer<L> {
    fn authorize(&self, user: UserId, capability: Capability, org_unit: OrgUnitId) -> bool {
        self.lookup.roles(user, org_unit).iter().any(|role| {
            self.policy
                .get(role)
                .is_some_and(|granted| granted.contains(&capability))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_follows_stage_being_left() {
        use Stage::*;
        assert_eq!(Capability::for_transition(Creation, PendingApproval), Capability::Submit);
        assert_eq!(Capability::for_transition(PendingApproval, FeeDefinition), Capability::Approve);
        assert_eq!(Capability::for_transition(FeeDefinition, AwaitingPayment), Capability::DefineFee);
        assert_eq!(Capability::for_transition(AwaitingPayment, Ceremony), Capability::RegisterPayment);
        assert_eq!(Capability::for_transition(Ceremony, FinalApproval), Capability::Complete);
        assert_eq!(Capability::for_transition(FeeDefinition, Rejected), Capability::Reject);
        assert_eq!(Capability::for_transition(Creation, Cancelled), Capability::Cancel);
    }

    #[test]
    fn test_role_authorizer() {
        let org = OrgUnitId::new();
        let treasurer = UserId::new();
        let secretary = UserId::new();
        let roles = StaticRoles::new()
            .grant(treasurer, org, Role::Treasurer)
            .grant(secretary, org, Role::Secretary);
        let authz = RoleAuthorizer::new(roles);

        assert!(authz.authorize(treasurer, Capability::DefineFee, org));
        assert!(!authz.authorize(treasurer, Capability::Approve, org));
        assert!(authz.authorize(secretary, Capability::CreateProtocol, org));
        // roles do not carry over to other org-units
        assert!(!authz.authorize(secretary, Capability::CreateProtocol, OrgUnitId::new()));
    }

    #[test]
    fn test_extra_grants() {
        let org = OrgUnitId::new();
        let member = UserId::new();
        let authz = RoleAuthorizer::new(StaticRoles::new().grant(member, org, Role::Member))
            .with_grant(Role::Member, Capability::CreateProtocol);
        assert!(authz.authorize(member, Capability::CreateProtocol, org));
        assert!(!authz.authorize(member, Capability::Cancel, org));
    }

    #[test]
    fn test_mocked_authorizer() {
        let mut mock = MockAuthorizer::new();
        mock.expect_authorize()
            .withf(|_, capability, _| *capability == Capability::Archive)
            .return_const(false);
        assert!(!mock.authorize(UserId::new(), Capability::Archive, OrgUnitId::new()));
    }
}
