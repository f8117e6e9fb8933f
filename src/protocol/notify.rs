// Post-transition notifications. Delivery (email, in-app) lives behind the trait.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::protocol::types::{Actor, ProtocolId, ProtocolStatus, ProtocolType, Stage};

/// Payload handed to notifiers after a transition is committed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionEvent {
    pub protocol_id: ProtocolId,
    pub number: String,
    pub protocol_type: ProtocolType,
    pub from: Stage,
    pub to: Stage,
    pub status: ProtocolStatus,
    pub actor: Actor,
    pub comment: Option<String>,
    pub at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    /// Called once per committed transition; must not fail the transition
    fn transition_succeeded(&self, event: &TransitionEvent);
}

/// Emits each event as a structured log line
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn transition_succeeded(&self, event: &TransitionEvent) {
        info!(
            protocol.number = %event.number,
            protocol.kind = %event.protocol_type,
            from_stage = %event.from,
            to_stage = %event.to,
            status = %event.status,
            actor = %event.actor,
            "Protocol transition committed"
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn transition_succeeded(&self, _event: &TransitionEvent) {}
}
