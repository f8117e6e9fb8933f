// Periodic sweeps. Anything that changes a protocol goes through the executor
// as `Actor::System`; scheduling the sweeps is left to the caller.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::WorkflowResult;
use crate::protocol::executor::TransitionExecutor;
use crate::protocol::types::{Actor, ProtocolId, Stage};
use crate::store::ProtocolFilter;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub cancelled: Vec<String>,
    /// Protocol number and the reason it could not be cancelled
    pub failed: Vec<(String, String)>,
}

/// An open protocol that has sat in its stage longer than allowed
#[derive(Debug, Clone, Serialize)]
pub struct OverdueProtocol {
    pub id: ProtocolId,
    pub number: String,
    pub stage: Stage,
    pub since: DateTime<Utc>,
    pub overdue_days: i64,
}

/// Cancel drafts nobody has touched for `max_age`
pub async fn cancel_abandoned_drafts(
    executor: &TransitionExecutor,
    now: DateTime<Utc>,
    max_age: Duration,
) -> WorkflowResult<SweepReport> {
    let filter = ProtocolFilter {
        stage: Some(Stage::Creation),
        ..ProtocolFilter::open()
    };
    let drafts = executor.list(&filter).await?;
    let cutoff = now - max_age;
    let mut report = SweepReport {
        examined: drafts.len(),
        ..Default::default()
    };

    for draft in drafts.into_iter().filter(|p| p.updated_at < cutoff) {
        let comment = format!(
            "Cancelado automaticamente: rascunho sem movimentação há mais de {} dias",
            max_age.num_days()
        );
        match executor.cancel(draft.id, Actor::System, Some(comment)).await {
            Ok(_) => report.cancelled.push(draft.number.to_string()),
            Err(e) => {
                warn!(protocol.number = %draft.number, error = %e, "Could not cancel abandoned draft");
                report.failed.push((draft.number.to_string(), e.to_string()));
            }
        }
    }

    info!(
        examined = report.examined,
        cancelled = report.cancelled.len(),
        failed = report.failed.len(),
        "Abandoned draft sweep finished"
    );
    Ok(report)
}

/// Open protocols whose last stage change is older than `sla`, most overdue first
pub async fn overdue_protocols(
    executor: &TransitionExecutor,
    now: DateTime<Utc>,
    sla: Duration,
) -> WorkflowResult<Vec<OverdueProtocol>> {
    let mut overdue: Vec<OverdueProtocol> = executor
        .list(&ProtocolFilter::open())
        .await?
        .into_iter()
        .filter(|p| now - p.stage_changed_at > sla)
        .map(|p| OverdueProtocol {
            id: p.id,
            number: p.number.to_string(),
            stage: p.stage,
            since: p.stage_changed_at,
            overdue_days: (now - p.stage_changed_at - sla).num_days(),
        })
        .collect();
    overdue.sort_by_key(|o| o.since);
    Ok(overdue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{NewProtocol, OrgUnitId, ProtocolStatus, ProtocolType, UserId};
    use crate::protocol::workflow::WorkflowRegistry;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn executor() -> TransitionExecutor {
        let store = Arc::new(MemoryStore::new());
        TransitionExecutor::new(store.clone(), store, WorkflowRegistry::builtin())
    }

    #[tokio::test]
    async fn test_only_stale_drafts_are_cancelled() {
        let executor = executor();
        let org = OrgUnitId::new();
        let user = UserId::new();
        let draft = executor
            .create(NewProtocol::new(ProtocolType::Transfer, "Rascunho", org, user), Actor::System)
            .await
            .unwrap();
        let submitted = executor
            .create(NewProtocol::new(ProtocolType::Transfer, "Enviado", org, user), Actor::System)
            .await
            .unwrap();
        executor.submit(submitted.id, Actor::System, None).await.unwrap();

        // nothing is old enough yet
        let report = cancel_abandoned_drafts(&executor, Utc::now(), Duration::days(30))
            .await
            .unwrap();
        assert!(report.cancelled.is_empty());

        let later = Utc::now() + Duration::days(31);
        let report = cancel_abandoned_drafts(&executor, later, Duration::days(30))
            .await
            .unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.cancelled, vec![draft.number.to_string()]);

        let cancelled = executor.load(draft.id).await.unwrap();
        assert_eq!(cancelled.status, ProtocolStatus::Cancelled);
        let still_open = executor.load(submitted.id).await.unwrap();
        assert_eq!(still_open.stage, Stage::PendingApproval);
    }

    #[tokio::test]
    async fn test_overdue_report_is_read_only() {
        let executor = executor();
        let protocol = executor
            .create(
                NewProtocol::new(ProtocolType::Honors, "Honraria", OrgUnitId::new(), UserId::new()),
                Actor::System,
            )
            .await
            .unwrap();

        let overdue = overdue_protocols(&executor, Utc::now() + Duration::days(10), Duration::days(7))
            .await
            .unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].number, protocol.number.to_string());
        assert!(overdue[0].overdue_days >= 2);

        let untouched = executor.load(protocol.id).await.unwrap();
        assert_eq!(untouched.version, protocol.version);
    }
}
