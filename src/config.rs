use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::audit::MoneyFormat;
use crate::protocol::numbering::NumberingPolicy;
use crate::protocol::workflow::WorkflowRegistry;

/// Main configuration structure for the protocol workflow
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolWorkflowConfig {
    /// JSON snapshot store used by the CLI
    pub store: StoreConfig,
    /// Database settings (used with the `database` feature)
    pub database: Option<DatabaseConfig>,
    /// Protocol number allocation
    pub numbering: NumberingConfig,
    /// Periodic sweep thresholds
    pub sweeps: SweepConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Money formatting in audit descriptions
    pub money: MoneyFormat,
    /// Optional TOML file overriding the built-in workflow definitions
    pub workflows_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub snapshot_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: ".protocolo/protocols.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://.protocolo/protocols.db".to_string(),
            max_connections: 5,
            auto_migrate: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NumberingConfig {
    /// Attempts before a number collision is reported
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for NumberingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 20,
            max_delay_ms: 500,
        }
    }
}

impl NumberingConfig {
    pub fn policy(&self) -> NumberingPolicy {
        NumberingPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Drafts untouched for this long are cancelled
    pub draft_max_age_days: i64,
    /// Open protocols stuck in one stage for this long are reported
    pub stage_sla_days: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            draft_max_age_days: 30,
            stage_sla_days: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is not set
    pub log_level: String,
    /// Emit JSON log lines instead of compact text
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for ProtocolWorkflowConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            database: Some(DatabaseConfig::default()),
            numbering: NumberingConfig::default(),
            sweeps: SweepConfig::default(),
            observability: ObservabilityConfig::default(),
            money: MoneyFormat::default(),
            workflows_file: None,
        }
    }
}

impl ProtocolWorkflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (protocol-workflow.toml, .protocol-workflow-rc)
    /// 3. Environment variables (PROTOCOL_WORKFLOW_SECTION__FIELD)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        if Path::new("protocol-workflow.toml").exists() {
            builder = builder.add_source(File::with_name("protocol-workflow"));
        }

        if Path::new(".protocol-workflow-rc").exists() {
            builder = builder.add_source(
                File::with_name(".protocol-workflow-rc").format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("PROTOCOL_WORKFLOW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load a single TOML file over the defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    /// Built-in workflows, overridden by `workflows_file` when set
    pub fn workflow_registry(&self) -> Result<WorkflowRegistry> {
        match &self.workflows_file {
            Some(path) => WorkflowRegistry::load_file(path),
            None => Ok(WorkflowRegistry::builtin()),
        }
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<ProtocolWorkflowConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = ProtocolWorkflowConfig::load_env_file();
        ProtocolWorkflowConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static ProtocolWorkflowConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: ProtocolWorkflowConfig = toml::from_str(
            r#"
            [numbering]
            max_attempts = 9

            [money]
            symbol = "US$"
            "#,
        )
        .unwrap();
        assert_eq!(config.numbering.max_attempts, 9);
        assert_eq!(config.numbering.base_delay_ms, 20);
        assert_eq!(config.money.symbol, "US$");
        assert_eq!(config.money.decimal_separator, ',');
        assert_eq!(config.sweeps.draft_max_age_days, 30);
        assert_eq!(config.store.snapshot_path, ".protocolo/protocols.json");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protocol-workflow.toml");
        let mut config = ProtocolWorkflowConfig::default();
        config.sweeps.stage_sla_days = 3;
        config.observability.json = true;
        config.save_to_file(&path).unwrap();

        let reloaded = ProtocolWorkflowConfig::load_from_file(&path).unwrap();
        assert_eq!(reloaded.sweeps.stage_sla_days, 3);
        assert!(reloaded.observability.json);
        assert_eq!(reloaded.database.unwrap().max_connections, 5);
    }

    #[test]
    fn test_numbering_policy_from_config() {
        let policy = NumberingConfig {
            max_attempts: 3,
            base_delay_ms: 5,
            max_delay_ms: 50,
        }
        .policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(5));
        assert!(policy.jitter);
    }
}
