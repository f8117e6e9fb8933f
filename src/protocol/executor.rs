// Transition executor: the only path through which protocols change.
//
// Every operation loads the protocol, checks it against its workflow snapshot
// and the authorizer, then commits the new protocol state together with its
// audit entries in one store call guarded by the protocol version.

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

use crate::audit::{AuditAction, AuditEntry, AuditLogger, AuditRecord, MoneyFormat, StateSnapshot, Timeline};
use crate::error::{StoreError, WorkflowError, WorkflowResult};
use crate::protocol::authz::{AllowAll, Authorizer, Capability};
use crate::protocol::effects::{CompletionEffects, MemberDirectory, SideEffectReport};
use crate::protocol::notify::{Notifier, TracingNotifier, TransitionEvent};
use crate::protocol::numbering::{NumberAllocator, NumberingPolicy, ProtocolNumber};
use crate::protocol::types::{
    Actor, MemberId, NewProtocol, OrgUnitId, Protocol, ProtocolId, ProtocolStatus, Stage,
};
use crate::protocol::workflow::WorkflowRegistry;
use crate::store::{ProtocolFilter, ProtocolStore};
use crate::telemetry::{create_protocol_span, generate_correlation_id};

/// Result of a committed transition
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub protocol: Protocol,
    pub from: Stage,
    pub to: Stage,
    /// Present when the transition reached Completed
    pub side_effects: Option<SideEffectReport>,
}

/// Check that `to` is reachable from the protocol's current stage
pub fn check_transition(protocol: &Protocol, to: Stage) -> WorkflowResult<()> {
    if protocol.is_terminal() {
        return Err(WorkflowError::TerminalState {
            number: protocol.number.to_string(),
            stage: protocol.stage,
        });
    }
    match to {
        Stage::Rejected | Stage::Cancelled => Ok(()),
        _ if protocol.next_stage() == Some(to) => Ok(()),
        _ => Err(WorkflowError::InvalidTransition {
            from: protocol.stage,
            to,
        }),
    }
}

fn is_exit(stage: Stage) -> bool {
    matches!(stage, Stage::Rejected | Stage::Cancelled)
}

fn transition_description(from: Stage, to: Stage) -> String {
    match AuditAction::for_transition(from, to) {
        AuditAction::SubmitForApproval => "Protocolo enviado para aprovação".to_string(),
        AuditAction::Approval => format!("Aprovado na etapa {}", from.label()),
        AuditAction::Rejection => "Protocolo rejeitado".to_string(),
        AuditAction::Cancellation => "Protocolo cancelado".to_string(),
        _ => format!("Etapa alterada de {} para {}", from.label(), to.label()),
    }
}

/// Copy of `protocol` with the version bumped, ready to be committed
fn next_version(protocol: &Protocol, now: DateTime<Utc>) -> Protocol {
    let mut updated = protocol.clone();
    updated.version += 1;
    updated.updated_at = now;
    updated
}

pub struct TransitionExecutor {
    store: Arc<dyn ProtocolStore>,
    members: Arc<dyn MemberDirectory>,
    registry: Arc<WorkflowRegistry>,
    allocator: NumberAllocator,
    authorizer: Arc<dyn Authorizer>,
    notifier: Arc<dyn Notifier>,
    effects: CompletionEffects,
    audit: AuditLogger<dyn ProtocolStore>,
}

impl TransitionExecutor {
    pub fn new(
        store: Arc<dyn ProtocolStore>,
        members: Arc<dyn MemberDirectory>,
        registry: WorkflowRegistry,
    ) -> Self {
        Self {
            audit: AuditLogger::new(Arc::clone(&store)),
            store,
            members,
            registry: Arc::new(registry),
            allocator: NumberAllocator::default(),
            authorizer: Arc::new(AllowAll),
            notifier: Arc::new(TracingNotifier),
            effects: CompletionEffects::builtin(),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_numbering(mut self, policy: NumberingPolicy) -> Self {
        self.allocator = NumberAllocator::new(policy);
        self
    }

    pub fn with_money_format(mut self, money: MoneyFormat) -> Self {
        self.audit = self.audit.with_money_format(money);
        self
    }

    pub fn with_effects(mut self, effects: CompletionEffects) -> Self {
        self.effects = effects;
        self
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn audit(&self) -> &AuditLogger<dyn ProtocolStore> {
        &self.audit
    }

    pub fn members(&self) -> &Arc<dyn MemberDirectory> {
        &self.members
    }

    fn authorize(&self, actor: Actor, capability: Capability, org_unit: OrgUnitId) -> WorkflowResult<()> {
        match actor {
            Actor::System => Ok(()),
            Actor::User(user) if self.authorizer.authorize(user, capability, org_unit) => Ok(()),
            Actor::User(_) => Err(WorkflowError::Unauthorized {
                actor: actor.to_string(),
                capability: capability.to_string(),
            }),
        }
    }

    pub async fn load(&self, id: ProtocolId) -> WorkflowResult<Protocol> {
        self.store
            .get_protocol(id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))
    }

    /// Look a protocol up by number.
    ///
    /// Each org-unit numbers its own protocols, so without `org_unit` the
    /// number must be used by exactly one of them.
    pub async fn find(&self, number: &ProtocolNumber, org_unit: Option<OrgUnitId>) -> WorkflowResult<Protocol> {
        if let Some(org_unit) = org_unit {
            return self
                .store
                .find_by_number(org_unit, number)
                .await?
                .ok_or_else(|| WorkflowError::NotFound(number.to_string()));
        }

        let filter = ProtocolFilter {
            number: Some(number.clone()),
            include_archived: true,
            ..Default::default()
        };
        let mut found = self.store.list_protocols(&filter).await?;
        match found.len() {
            0 => Err(WorkflowError::NotFound(number.to_string())),
            1 => Ok(found.remove(0)),
            n => Err(WorkflowError::validation(format!(
                "{n} org units use protocol number {number}; name the org unit"
            ))),
        }
    }

    pub async fn list(&self, filter: &ProtocolFilter) -> WorkflowResult<Vec<Protocol>> {
        Ok(self.store.list_protocols(filter).await?)
    }

    fn ensure_not_archived(protocol: &Protocol) -> WorkflowResult<()> {
        if protocol.is_archived() {
            return Err(WorkflowError::validation(format!(
                "protocol {} is archived",
                protocol.number
            )));
        }
        Ok(())
    }

    fn ensure_open(protocol: &Protocol) -> WorkflowResult<()> {
        if protocol.is_terminal() {
            return Err(WorkflowError::TerminalState {
                number: protocol.number.to_string(),
                stage: protocol.stage,
            });
        }
        Self::ensure_not_archived(protocol)
    }

    async fn commit(
        &self,
        previous: &Protocol,
        updated: &Protocol,
        records: Vec<AuditRecord>,
        actor: Actor,
    ) -> WorkflowResult<Vec<AuditEntry>> {
        let entries: Vec<AuditEntry> = records
            .into_iter()
            .map(|record| record.into_entry(updated, actor.user_id()))
            .collect();
        match self
            .store
            .commit_update(updated, previous.version, &entries)
            .await
        {
            Ok(()) => Ok(entries),
            Err(StoreError::VersionConflict { .. }) => {
                warn!(protocol.number = %updated.number, "Concurrent modification detected");
                Err(WorkflowError::StaleProtocol {
                    number: updated.number.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open a protocol at the first stage of its type's workflow
    pub async fn create(&self, input: NewProtocol, actor: Actor) -> WorkflowResult<Protocol> {
        let span = create_protocol_span("create", None, &generate_correlation_id());
        self.create_inner(input, actor).instrument(span).await
    }

    async fn create_inner(&self, input: NewProtocol, actor: Actor) -> WorkflowResult<Protocol> {
        self.authorize(actor, Capability::CreateProtocol, input.org_unit)?;

        let title = input.title.trim().to_string();
        if title.is_empty() {
            return Err(WorkflowError::validation("title is required"));
        }
        if let Some(member) = input.member {
            if self.members.get_member(member).await?.is_none() {
                return Err(WorkflowError::NotFound(format!("member {member}")));
            }
        }

        let definition = self.registry.get(input.protocol_type)?;
        let steps = definition.steps.clone();
        let initial = definition.initial_step();
        let now = Utc::now();
        let actor_id = actor.user_id();

        let protocol = self
            .allocator
            .allocate_and_insert(
                self.store.as_ref(),
                input.org_unit,
                input.protocol_type,
                now.year(),
                |number| {
                    let description = format!("Protocolo {number} criado");
                    let protocol = Protocol {
                        id: ProtocolId::new(),
                        number,
                        protocol_type: input.protocol_type,
                        title: title.clone(),
                        description: input.description.clone(),
                        status: initial.implied_status(),
                        stage: initial,
                        steps: steps.clone(),
                        requester: input.requester,
                        approver: input.approver,
                        org_unit: input.org_unit,
                        member: input.member,
                        payload: input.payload.clone(),
                        fee: None,
                        submitted_at: (initial == Stage::PendingApproval).then_some(now),
                        approved_at: None,
                        completed_at: None,
                        rejection_feedback: None,
                        stage_changed_at: now,
                        created_at: now,
                        updated_at: now,
                        deleted_at: None,
                        version: 1,
                    };
                    let entry = AuditRecord::new(AuditAction::Creation, description)
                        .after(
                            StateSnapshot::of(&protocol)
                                .with_data(Value::Object(protocol.payload.clone())),
                        )
                        .into_entry(&protocol, actor_id);
                    (protocol, vec![entry])
                },
            )
            .await?;

        info!(
            protocol.number = %protocol.number,
            protocol.kind = %protocol.protocol_type,
            stage = %protocol.stage,
            actor = %actor,
            "Protocol created"
        );
        Ok(protocol)
    }

    /// Move a protocol to `to`.
    ///
    /// Reaching Completed dispatches the type's completion handler; see
    /// `dispatch_completion` for how its failures are reported.
    pub async fn transition(
        &self,
        id: ProtocolId,
        to: Stage,
        actor: Actor,
        comment: Option<String>,
    ) -> WorkflowResult<TransitionOutcome> {
        let span = create_protocol_span("transition", Some(&id.to_string()), &generate_correlation_id());
        async {
            let protocol = self.load(id).await?;
            self.apply_transition(protocol, to, actor, comment, Vec::new()).await
        }
        .instrument(span)
        .await
    }

    async fn apply_transition(
        &self,
        protocol: Protocol,
        to: Stage,
        actor: Actor,
        comment: Option<String>,
        extra: Vec<AuditRecord>,
    ) -> WorkflowResult<TransitionOutcome> {
        check_transition(&protocol, to)?;
        Self::ensure_not_archived(&protocol)?;
        let from = protocol.stage;
        self.authorize(actor, Capability::for_transition(from, to), protocol.org_unit)?;

        let comment = comment.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
        if to == Stage::Rejected && comment.is_none() {
            return Err(WorkflowError::validation("a rejection needs feedback for the requester"));
        }
        if from == Stage::FeeDefinition && !is_exit(to) && !protocol.fee.is_some_and(|fee| fee > Decimal::ZERO) {
            return Err(WorkflowError::validation("a fee greater than zero must be defined first"));
        }
        if from == Stage::AwaitingPayment
            && !is_exit(to)
            && !extra.iter().any(|r| r.action == AuditAction::Payment)
            && !self.audit.has_action(protocol.id, AuditAction::Payment).await?
        {
            return Err(WorkflowError::validation("payment has not been registered"));
        }

        if to == Stage::Completed {
            if let Some(handler) = self.effects.handler(protocol.protocol_type) {
                if let Err(errors) = handler.prepare(&protocol, self.members.as_ref()).await {
                    return Err(self.record_preparation_failure(&protocol, errors).await);
                }
            }
        }

        let now = Utc::now();
        let mut updated = next_version(&protocol, now);
        updated.stage = to;
        updated.status = to.implied_status();
        updated.stage_changed_at = now;
        match to {
            Stage::PendingApproval if updated.submitted_at.is_none() => updated.submitted_at = Some(now),
            Stage::Rejected => updated.rejection_feedback = comment.clone(),
            Stage::Completed => updated.completed_at = Some(now),
            _ => {}
        }
        if from.is_approval_stage() && !is_exit(to) {
            let approvals_left = protocol
                .steps
                .iter()
                .skip_while(|s| **s != to)
                .any(|s| s.is_approval_stage());
            if !approvals_left {
                updated.approved_at = Some(now);
            }
        }

        let mut records = extra;
        records.push(
            AuditRecord::new(AuditAction::for_transition(from, to), transition_description(from, to))
                .before(StateSnapshot::of(&protocol))
                .after(StateSnapshot::of(&updated))
                .comment(comment.clone()),
        );
        self.commit(&protocol, &updated, records, actor).await?;

        info!(
            protocol.number = %updated.number,
            from_stage = %from,
            to_stage = %to,
            actor = %actor,
            "Protocol transitioned"
        );
        self.notifier.transition_succeeded(&TransitionEvent {
            protocol_id: updated.id,
            number: updated.number.to_string(),
            protocol_type: updated.protocol_type,
            from,
            to,
            status: updated.status,
            actor,
            comment,
            at: now,
        });

        let side_effects = if to == Stage::Completed {
            Some(self.dispatch_completion(&updated).await?)
        } else {
            None
        };

        Ok(TransitionOutcome {
            protocol: updated,
            from,
            to,
            side_effects,
        })
    }

    /// Completion validation failed: keep the stage, flag the status and
    /// record why. Returns the error to surface to the caller.
    async fn record_preparation_failure(&self, protocol: &Protocol, errors: Vec<String>) -> WorkflowError {
        warn!(
            protocol.number = %protocol.number,
            errors = ?errors,
            "Completion validation failed"
        );
        let mut updated = next_version(protocol, Utc::now());
        updated.status = ProtocolStatus::ProcessingError;
        let record = AuditRecord::new(
            AuditAction::ProcessingError,
            format!("Erro ao processar conclusão: {}", errors.join("; ")),
        )
        .before(StateSnapshot::of(protocol))
        .after(StateSnapshot::of(&updated).with_data(json!({
            "error": "completion validation failed",
            "details": errors,
        })));

        match self.commit(protocol, &updated, vec![record], Actor::System).await {
            Ok(_) => WorkflowError::Validation(errors),
            Err(e) => e,
        }
    }

    /// Run the completion handler of a completed protocol.
    ///
    /// A `Completion` audit entry marks the effects as applied; once present,
    /// later calls report `AlreadyApplied` and touch nothing. Handler failures
    /// are written to the audit trail and reported, never returned as errors.
    pub async fn dispatch_completion(&self, protocol: &Protocol) -> WorkflowResult<SideEffectReport> {
        if protocol.stage != Stage::Completed {
            return Err(WorkflowError::validation(format!(
                "protocol {} is not completed",
                protocol.number
            )));
        }
        if self.audit.has_action(protocol.id, AuditAction::Completion).await? {
            info!(protocol.number = %protocol.number, "Completion effects already applied");
            return Ok(SideEffectReport::AlreadyApplied);
        }

        let Some(handler) = self.effects.handler(protocol.protocol_type) else {
            let record = AuditRecord::new(AuditAction::Completion, "Protocolo concluído")
                .after(StateSnapshot::of(protocol));
            self.audit.log(protocol, record, None).await?;
            return Ok(SideEffectReport::Skipped);
        };

        match handler.apply(protocol, self.members.as_ref()).await {
            Ok(summary) => {
                let record = AuditRecord::new(
                    AuditAction::Completion,
                    format!("Protocolo concluído: {summary}"),
                )
                .after(StateSnapshot::of(protocol).with_data(json!({ "effects": summary })));
                self.audit.log(protocol, record, None).await?;
                info!(protocol.number = %protocol.number, effects = %summary, "Completion effects applied");
                Ok(SideEffectReport::Applied { summary })
            }
            Err(e) => {
                let reason = format!("{e:#}");
                let failure = WorkflowError::SideEffect {
                    protocol_type: protocol.protocol_type,
                    reason: reason.clone(),
                };
                error!(
                    protocol.number = %protocol.number,
                    error = %failure,
                    "Completion handler failed; stage change stands"
                );
                self.audit
                    .log_processing_error(protocol, &reason, vec![failure.to_string()])
                    .await?;
                Ok(SideEffectReport::Failed {
                    error: Arc::new(failure),
                })
            }
        }
    }

    pub async fn submit(&self, id: ProtocolId, actor: Actor, comment: Option<String>) -> WorkflowResult<TransitionOutcome> {
        self.transition(id, Stage::PendingApproval, actor, comment).await
    }

    /// Move to the next stage of the protocol's workflow
    pub async fn advance(&self, id: ProtocolId, actor: Actor, comment: Option<String>) -> WorkflowResult<TransitionOutcome> {
        let protocol = self.load(id).await?;
        let Some(next) = protocol.next_stage() else {
            return Err(WorkflowError::TerminalState {
                number: protocol.number.to_string(),
                stage: protocol.stage,
            });
        };
        self.transition(id, next, actor, comment).await
    }

    /// Advance from an approval stage
    pub async fn approve(&self, id: ProtocolId, actor: Actor, comment: Option<String>) -> WorkflowResult<TransitionOutcome> {
        let protocol = self.load(id).await?;
        Self::ensure_open(&protocol)?;
        if !protocol.stage.is_approval_stage() {
            return Err(WorkflowError::InvalidTransition {
                from: protocol.stage,
                to: protocol.next_stage().unwrap_or(protocol.stage),
            });
        }
        self.advance(id, actor, comment).await
    }

    pub async fn reject(&self, id: ProtocolId, reason: &str, actor: Actor) -> WorkflowResult<TransitionOutcome> {
        self.transition(id, Stage::Rejected, actor, Some(reason.to_string())).await
    }

    pub async fn cancel(&self, id: ProtocolId, actor: Actor, comment: Option<String>) -> WorkflowResult<TransitionOutcome> {
        self.transition(id, Stage::Cancelled, actor, comment).await
    }

    /// Set or change the fee while the protocol is in FeeDefinition
    pub async fn define_fee(&self, id: ProtocolId, amount: Decimal, actor: Actor) -> WorkflowResult<Protocol> {
        let protocol = self.load(id).await?;
        Self::ensure_open(&protocol)?;
        self.authorize(actor, Capability::DefineFee, protocol.org_unit)?;
        if protocol.stage != Stage::FeeDefinition {
            return Err(WorkflowError::validation(format!(
                "fees can only be defined at {}, protocol is at {}",
                Stage::FeeDefinition,
                protocol.stage
            )));
        }
        if amount <= Decimal::ZERO {
            return Err(WorkflowError::validation("fee must be greater than zero"));
        }

        let record = self.audit.fee_definition_record(&protocol, amount);
        let mut updated = next_version(&protocol, Utc::now());
        updated.fee = Some(amount);
        self.commit(&protocol, &updated, vec![record], actor).await?;
        info!(protocol.number = %updated.number, fee = %amount, "Fee defined");
        Ok(updated)
    }

    /// Record the payment and leave AwaitingPayment in one commit
    pub async fn register_payment(&self, id: ProtocolId, actor: Actor, comment: Option<String>) -> WorkflowResult<TransitionOutcome> {
        let protocol = self.load(id).await?;
        Self::ensure_open(&protocol)?;
        if protocol.stage != Stage::AwaitingPayment {
            return Err(WorkflowError::validation(format!(
                "payments can only be registered at {}, protocol is at {}",
                Stage::AwaitingPayment,
                protocol.stage
            )));
        }
        let next = protocol.next_stage().ok_or(WorkflowError::InvalidTransition {
            from: protocol.stage,
            to: Stage::Completed,
        })?;
        let payment = self.audit.payment_record(&protocol);
        self.apply_transition(protocol, next, actor, comment, vec![payment]).await
    }

    /// Merge `changes` into the payload; null values remove keys.
    ///
    /// Correcting a protocol flagged with a processing error returns it to the
    /// status implied by its stage so completion can be retried.
    pub async fn update_payload(
        &self,
        id: ProtocolId,
        changes: Map<String, Value>,
        actor: Actor,
        comment: Option<String>,
    ) -> WorkflowResult<Protocol> {
        let protocol = self.load(id).await?;
        Self::ensure_open(&protocol)?;
        self.authorize(actor, Capability::Edit, protocol.org_unit)?;

        let mut payload = protocol.payload.clone();
        for (key, value) in changes {
            if value.is_null() {
                payload.remove(&key);
            } else {
                payload.insert(key, value);
            }
        }
        if payload == protocol.payload {
            return Ok(protocol);
        }

        let mut updated = next_version(&protocol, Utc::now());
        updated.payload = payload;
        let mut records = vec![AuditRecord::new(AuditAction::Edit, "Dados do protocolo alterados")
            .before(StateSnapshot::of(&protocol).with_data(Value::Object(protocol.payload.clone())))
            .after(StateSnapshot::of(&updated).with_data(Value::Object(updated.payload.clone())))
            .comment(comment)];

        if protocol.status == ProtocolStatus::ProcessingError {
            let before = StateSnapshot::of(&updated);
            updated.status = updated.stage.implied_status();
            records.push(
                AuditRecord::new(
                    AuditAction::StatusChange,
                    format!(
                        "Status alterado de {} para {}",
                        ProtocolStatus::ProcessingError.label(),
                        updated.status.label()
                    ),
                )
                .before(before)
                .after(StateSnapshot::of(&updated)),
            );
        }

        self.commit(&protocol, &updated, records, actor).await?;
        Ok(updated)
    }

    /// Soft delete; the protocol and its history stay in the store
    pub async fn archive(&self, id: ProtocolId, actor: Actor, comment: Option<String>) -> WorkflowResult<Protocol> {
        let protocol = self.load(id).await?;
        self.authorize(actor, Capability::Archive, protocol.org_unit)?;
        if protocol.is_archived() {
            return Err(WorkflowError::validation(format!(
                "protocol {} is already archived",
                protocol.number
            )));
        }
        let now = Utc::now();
        let mut updated = next_version(&protocol, now);
        updated.deleted_at = Some(now);
        let record = AuditRecord::new(AuditAction::Archived, "Protocolo arquivado")
            .before(StateSnapshot::of(&protocol))
            .after(StateSnapshot::of(&updated))
            .comment(comment);
        self.commit(&protocol, &updated, vec![record], actor).await?;
        Ok(updated)
    }

    fn listed_members(protocol: &Protocol) -> Vec<String> {
        protocol
            .payload_value("members")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reference a member from `payload.members`
    pub async fn add_member(&self, id: ProtocolId, member: MemberId, actor: Actor) -> WorkflowResult<Protocol> {
        let protocol = self.load(id).await?;
        Self::ensure_open(&protocol)?;
        self.authorize(actor, Capability::Edit, protocol.org_unit)?;
        let record = self
            .members
            .get_member(member)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("member {member}")))?;

        let mut listed = Self::listed_members(&protocol);
        let key = member.to_string();
        if listed.contains(&key) {
            return Err(WorkflowError::validation(format!(
                "{} is already listed on {}",
                record.name, protocol.number
            )));
        }
        listed.push(key.clone());

        let mut updated = next_version(&protocol, Utc::now());
        updated.payload.insert("members".to_string(), json!(listed));
        let entry = AuditRecord::new(AuditAction::MemberAdded, format!("Membro adicionado: {}", record.name))
            .after(StateSnapshot::empty().with_data(json!({ "member": key, "name": record.name })));
        self.commit(&protocol, &updated, vec![entry], actor).await?;
        Ok(updated)
    }

    pub async fn remove_member(&self, id: ProtocolId, member: MemberId, actor: Actor) -> WorkflowResult<Protocol> {
        let protocol = self.load(id).await?;
        Self::ensure_open(&protocol)?;
        self.authorize(actor, Capability::Edit, protocol.org_unit)?;

        let key = member.to_string();
        let mut listed = Self::listed_members(&protocol);
        let before = listed.len();
        listed.retain(|m| *m != key);
        if listed.len() == before {
            return Err(WorkflowError::validation(format!(
                "member {member} is not listed on {}",
                protocol.number
            )));
        }
        let name = self
            .members
            .get_member(member)
            .await?
            .map(|m| m.name)
            .unwrap_or_else(|| key.clone());

        let mut updated = next_version(&protocol, Utc::now());
        updated.payload.insert("members".to_string(), json!(listed));
        let entry = AuditRecord::new(AuditAction::MemberRemoved, format!("Membro removido: {name}"))
            .before(StateSnapshot::empty().with_data(json!({ "member": key, "name": name })));
        self.commit(&protocol, &updated, vec![entry], actor).await?;
        Ok(updated)
    }

    /// Record that a file was attached; storing the file is up to the caller
    pub async fn add_attachment(&self, id: ProtocolId, file_name: &str, actor: Actor) -> WorkflowResult<AuditEntry> {
        let protocol = self.load(id).await?;
        Self::ensure_not_archived(&protocol)?;
        self.authorize(actor, Capability::Edit, protocol.org_unit)?;
        let file_name = file_name.trim();
        if file_name.is_empty() {
            return Err(WorkflowError::validation("attachment name is required"));
        }
        self.audit
            .log_attachment_added(&protocol, file_name, actor.user_id())
            .await
    }

    pub async fn remove_attachment(&self, id: ProtocolId, file_name: &str, actor: Actor) -> WorkflowResult<AuditEntry> {
        let protocol = self.load(id).await?;
        Self::ensure_not_archived(&protocol)?;
        self.authorize(actor, Capability::Edit, protocol.org_unit)?;
        let file_name = file_name.trim();
        if file_name.is_empty() {
            return Err(WorkflowError::validation("attachment name is required"));
        }
        self.audit
            .log_attachment_removed(&protocol, file_name, actor.user_id())
            .await
    }

    pub async fn history(&self, id: ProtocolId, actor: Actor, newest_first: bool) -> WorkflowResult<Timeline> {
        let protocol = self.load(id).await?;
        self.authorize(actor, Capability::ViewHistory, protocol.org_unit)?;
        self.audit.timeline(protocol.id, newest_first).await
    }
}
