// Property-Based Testing for protocol workflows
// Random operation sequences must never break the stage/status invariants
// or rewrite the audit trail

use proptest::prelude::*;
use rust_decimal::Decimal;
use serde_json::{json, Map};
use std::sync::Arc;

use protocol_workflow::error::WorkflowError;
use protocol_workflow::protocol::{
    Actor, NewProtocol, OrgUnitId, ProtocolType, Stage, TransitionExecutor, UserId, WorkflowRegistry,
};
use protocol_workflow::store::{MemoryStore, ProtocolStore};

#[derive(Debug, Clone)]
enum Operation {
    Advance,
    DefineFee(i64),
    RegisterPayment,
    Reject,
    Cancel,
    Edit(u8),
    Archive,
}

fn operation_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![
        4 => Just(Operation::Advance),
        2 => (-500i64..100_000).prop_map(Operation::DefineFee),
        2 => Just(Operation::RegisterPayment),
        1 => Just(Operation::Reject),
        1 => Just(Operation::Cancel),
        1 => any::<u8>().prop_map(Operation::Edit),
        1 => Just(Operation::Archive),
    ]
}

fn protocol_type_strategy() -> impl Strategy<Value = ProtocolType> {
    prop::sample::select(ProtocolType::ALL.to_vec())
}

#[cfg(test)]
mod property_tests {
    use super::*;

    #[test]
    fn prop_random_operations_keep_protocol_consistent() {
        let mut runner = proptest::test_runner::TestRunner::new(ProptestConfig::with_cases(64));

        runner
            .run(
                &(protocol_type_strategy(), prop::collection::vec(operation_strategy(), 0..30)),
                |(protocol_type, operations)| {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    rt.block_on(async {
                        let store = Arc::new(MemoryStore::new());
                        let executor =
                            TransitionExecutor::new(store.clone(), store.clone(), WorkflowRegistry::builtin());
                        let user = UserId::new();
                        let actor = Actor::User(user);
                        let protocol = executor
                            .create(NewProtocol::new(protocol_type, "Pedido", OrgUnitId::new(), user), actor)
                            .await
                            .unwrap();
                        let id = protocol.id;
                        let mut history = store.audit_entries(id).await.unwrap();

                        for operation in operations {
                            let before = executor.load(id).await.unwrap();
                            let succeeded = match operation {
                                Operation::Advance => executor.advance(id, actor, None).await.is_ok(),
                                Operation::DefineFee(cents) => executor
                                    .define_fee(id, Decimal::new(cents, 2), actor)
                                    .await
                                    .is_ok(),
                                Operation::RegisterPayment => {
                                    executor.register_payment(id, actor, None).await.is_ok()
                                }
                                Operation::Reject => executor.reject(id, "Recusado", actor).await.is_ok(),
                                Operation::Cancel => executor.cancel(id, actor, None).await.is_ok(),
                                Operation::Edit(value) => {
                                    let mut changes = Map::new();
                                    changes.insert("note".to_string(), json!(value));
                                    executor.update_payload(id, changes, actor, None).await.is_ok()
                                }
                                Operation::Archive => executor.archive(id, actor, None).await.is_ok(),
                            };

                            let after = executor.load(id).await.unwrap();
                            prop_assert!(after.is_consistent(), "inconsistent after {:?}: {:?}", operation, after);
                            prop_assert!(after.version >= before.version);
                            if before.is_terminal() {
                                // archiving is the one change a terminal protocol still accepts
                                if !matches!(operation, Operation::Archive) {
                                    prop_assert!(!succeeded, "{:?} changed a terminal protocol", operation);
                                }
                                prop_assert_eq!(after.stage, before.stage);
                                let moved = executor
                                    .transition(id, Stage::Rejected, Actor::System, Some("x".to_string()))
                                    .await;
                                prop_assert!(
                                    matches!(moved, Err(WorkflowError::TerminalState { .. })),
                                    "terminal protocol answered {:?}",
                                    moved
                                );
                            }

                            let current = store.audit_entries(id).await.unwrap();
                            prop_assert!(current.len() >= history.len());
                            prop_assert_eq!(&current[..history.len()], &history[..]);
                            history = current;
                        }
                        Ok(())
                    })
                },
            )
            .unwrap();
    }
}
