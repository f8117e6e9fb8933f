// Protocol workflow engine - types, workflow definitions, transitions and
// completion side effects

pub mod authz;
pub mod effects;
pub mod executor;
pub mod notify;
pub mod numbering;
pub mod sweeps;
pub mod types;
pub mod workflow;

#[cfg(test)]
pub mod mocks;

pub use authz::{AllowAll, Authorizer, Capability, Role, RoleAuthorizer, RoleLookup, StaticRoles};
pub use effects::{CompletionEffects, CompletionHandler, MemberDirectory, SideEffectReport};
pub use executor::{check_transition, TransitionExecutor, TransitionOutcome};
pub use notify::{NoopNotifier, Notifier, TracingNotifier, TransitionEvent};
pub use numbering::{NumberAllocator, NumberingPolicy, ProtocolNumber};
pub use types::*;
pub use workflow::{WorkflowDefinition, WorkflowRegistry};
