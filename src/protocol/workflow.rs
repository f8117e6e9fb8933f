// Workflow definitions: the ordered stages each protocol type goes through.
//
// Definitions are plain data so the executor stays generic. A protocol keeps a
// copy of its steps from creation time, so changing a definition only affects
// protocols opened afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{WorkflowError, WorkflowResult};
use crate::protocol::types::{ProtocolType, Stage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub protocol_type: ProtocolType,
    pub steps: Vec<Stage>,
}

impl WorkflowDefinition {
    pub fn new(protocol_type: ProtocolType, steps: Vec<Stage>) -> WorkflowResult<Self> {
        let definition = Self {
            protocol_type,
            steps,
        };
        definition.validate()?;
        Ok(definition)
    }

    fn invalid(&self, reason: impl Into<String>) -> WorkflowError {
        WorkflowError::InvalidDefinition {
            protocol_type: self.protocol_type,
            reason: reason.into(),
        }
    }

    pub fn validate(&self) -> WorkflowResult<()> {
        let first = self.steps.first().ok_or_else(|| self.invalid("no stages"))?;
        if first.is_terminal() {
            return Err(self.invalid(format!("cannot start at terminal stage {first}")));
        }
        if self.steps.last() != Some(&Stage::Completed) {
            return Err(self.invalid("last stage must be completed"));
        }
        let closing = self.steps.len().checked_sub(2).map(|i| self.steps[i]);
        if !closing.is_some_and(Stage::is_approval_stage) {
            return Err(self.invalid("completed must directly follow an approval stage"));
        }
        if let Some(stage) = self
            .steps
            .iter()
            .find(|s| matches!(s, Stage::Rejected | Stage::Cancelled))
        {
            return Err(self.invalid(format!("{stage} is implicit and cannot be listed")));
        }
        for (i, stage) in self.steps.iter().enumerate() {
            if self.steps[..i].contains(stage) {
                return Err(self.invalid(format!("stage {stage} listed twice")));
            }
        }
        Ok(())
    }

    pub fn initial_step(&self) -> Stage {
        self.steps[0]
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.steps.contains(&stage)
    }
}

#[derive(Debug, Deserialize)]
struct WorkflowFile {
    #[serde(default)]
    workflow: Vec<RawDefinition>,
}

#[derive(Debug, Deserialize)]
struct RawDefinition {
    protocol_type: String,
    steps: Vec<Stage>,
}

/// Registered workflow definitions keyed by protocol type
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<ProtocolType, WorkflowDefinition>,
}

impl WorkflowRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Definitions shipped with the crate, one per protocol type
    pub fn builtin() -> Self {
        use Stage::*;

        let paid_with_ceremony = vec![
            Creation,
            PendingApproval,
            FeeDefinition,
            AwaitingPayment,
            Ceremony,
            FinalApproval,
            Completed,
        ];
        let paid = vec![
            Creation,
            PendingApproval,
            FeeDefinition,
            AwaitingPayment,
            FinalApproval,
            Completed,
        ];
        let two_approvals = vec![Creation, PendingApproval, FinalApproval, Completed];
        let single_approval = vec![Creation, PendingApproval, Completed];

        let table = [
            (ProtocolType::Initiation, paid_with_ceremony),
            (ProtocolType::Return, paid.clone()),
            (ProtocolType::ComingOfAge, paid),
            (ProtocolType::LeaveOfAbsence, two_approvals.clone()),
            (ProtocolType::Transfer, two_approvals.clone()),
            (ProtocolType::Dismissal, two_approvals.clone()),
            (ProtocolType::Honors, two_approvals),
            (ProtocolType::OfficerAssignment, single_approval),
        ];

        let definitions = table
            .into_iter()
            .map(|(protocol_type, steps)| {
                (
                    protocol_type,
                    WorkflowDefinition {
                        protocol_type,
                        steps,
                    },
                )
            })
            .collect();

        Self { definitions }
    }

    pub fn register(&mut self, definition: WorkflowDefinition) -> WorkflowResult<()> {
        definition.validate()?;
        self.definitions.insert(definition.protocol_type, definition);
        Ok(())
    }

    /// Parse `[[workflow]]` tables and register them over the current definitions
    pub fn apply_toml(&mut self, content: &str) -> WorkflowResult<()> {
        let file: WorkflowFile = toml::from_str(content).map_err(|e| {
            WorkflowError::validation(format!("invalid workflow file: {e}"))
        })?;
        for raw in file.workflow {
            let protocol_type = raw
                .protocol_type
                .parse::<ProtocolType>()
                .map_err(WorkflowError::UnknownType)?;
            self.register(WorkflowDefinition::new(protocol_type, raw.steps)?)?;
        }
        Ok(())
    }

    /// Built-in definitions overridden by the given TOML document
    pub fn from_toml(content: &str) -> WorkflowResult<Self> {
        let mut registry = Self::builtin();
        registry.apply_toml(content)?;
        Ok(registry)
    }

    pub fn load_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let registry = Self::from_toml(&content)?;
        tracing::info!(path = %path.as_ref().display(), "Loaded workflow definitions");
        Ok(registry)
    }

    pub fn get(&self, protocol_type: ProtocolType) -> WorkflowResult<&WorkflowDefinition> {
        self.definitions
            .get(&protocol_type)
            .ok_or_else(|| WorkflowError::UnknownType(protocol_type.to_string()))
    }

    pub fn initial_step(&self, protocol_type: ProtocolType) -> WorkflowResult<Stage> {
        self.get(protocol_type).map(WorkflowDefinition::initial_step)
    }

    pub fn all_steps(&self, protocol_type: ProtocolType) -> WorkflowResult<Vec<Stage>> {
        self.get(protocol_type).map(|d| d.steps.clone())
    }

    /// Lookup by the name used in configuration files and the CLI
    pub fn initial_step_by_name(&self, name: &str) -> WorkflowResult<Stage> {
        let protocol_type = name.parse::<ProtocolType>().map_err(WorkflowError::UnknownType)?;
        self.initial_step(protocol_type)
    }

    pub fn protocol_types(&self) -> Vec<ProtocolType> {
        let mut types: Vec<ProtocolType> = self.definitions.keys().copied().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_step_is_part_of_every_builtin_workflow() {
        let registry = WorkflowRegistry::builtin();
        for protocol_type in ProtocolType::ALL {
            let initial = registry.initial_step(protocol_type).unwrap();
            let steps = registry.all_steps(protocol_type).unwrap();
            assert!(steps.contains(&initial), "{protocol_type} initial stage missing");
            assert_eq!(steps.last(), Some(&Stage::Completed));
        }
    }

    #[test]
    fn test_leave_of_absence_has_no_fee_stage() {
        let steps = WorkflowRegistry::builtin()
            .all_steps(ProtocolType::LeaveOfAbsence)
            .unwrap();
        assert!(!steps.contains(&Stage::FeeDefinition));
        assert!(!steps.contains(&Stage::AwaitingPayment));
    }

    #[test]
    fn test_initiation_has_fee_and_ceremony() {
        let steps = WorkflowRegistry::builtin()
            .all_steps(ProtocolType::Initiation)
            .unwrap();
        assert!(steps.contains(&Stage::FeeDefinition));
        assert!(steps.contains(&Stage::Ceremony));
    }

    #[test]
    fn test_unknown_type() {
        let registry = WorkflowRegistry::empty();
        assert!(matches!(
            registry.initial_step(ProtocolType::Honors),
            Err(WorkflowError::UnknownType(_))
        ));
        assert!(matches!(
            WorkflowRegistry::builtin().initial_step_by_name("promotion"),
            Err(WorkflowError::UnknownType(name)) if name == "promotion"
        ));
    }

    #[test]
    fn test_toml_overrides_builtin() {
        let registry = WorkflowRegistry::from_toml(
            r#"
            [[workflow]]
            protocol_type = "honors"
            steps = ["creation", "final_approval", "completed"]
            "#,
        )
        .unwrap();
        assert_eq!(
            registry.all_steps(ProtocolType::Honors).unwrap(),
            vec![Stage::Creation, Stage::FinalApproval, Stage::Completed]
        );
        assert_eq!(
            registry.all_steps(ProtocolType::Transfer).unwrap(),
            WorkflowRegistry::builtin().all_steps(ProtocolType::Transfer).unwrap()
        );
    }

    #[test]
    fn test_toml_completing_without_approval_is_rejected() {
        let err = WorkflowRegistry::from_toml(
            r#"
            [[workflow]]
            protocol_type = "honors"
            steps = ["creation", "completed"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::InvalidDefinition { protocol_type: ProtocolType::Honors, .. }
        ));
    }

    #[test]
    fn test_toml_with_unknown_type_is_rejected() {
        let err = WorkflowRegistry::from_toml(
            r#"
            [[workflow]]
            protocol_type = "promotion"
            steps = ["creation", "pending_approval", "completed"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownType(_)));
    }

    #[test]
    fn test_invalid_definitions() {
        let cases = vec![
            vec![],
            vec![Stage::Creation, Stage::PendingApproval],
            vec![Stage::Creation, Stage::Rejected, Stage::Completed],
            vec![Stage::Creation, Stage::PendingApproval, Stage::PendingApproval, Stage::Completed],
            vec![Stage::Completed],
            vec![Stage::Creation, Stage::Completed],
            vec![Stage::Creation, Stage::PendingApproval, Stage::Ceremony, Stage::Completed],
        ];
        for steps in cases {
            let result = WorkflowDefinition::new(ProtocolType::Transfer, steps.clone());
            assert!(
                matches!(result, Err(WorkflowError::InvalidDefinition { .. })),
                "{steps:?} should be rejected"
            );
        }
    }
}
