use anyhow::{anyhow, bail, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::sync::Arc;

use protocol_workflow::audit::AuditAction;
use protocol_workflow::config::{config, ProtocolWorkflowConfig};
use protocol_workflow::error::StoreError;
use protocol_workflow::protocol::sweeps::{cancel_abandoned_drafts, overdue_protocols};
use protocol_workflow::protocol::{
    Actor, MemberDirectory, MemberId, NewMember, NewProtocol, OrgUnitId, Protocol, ProtocolNumber,
    ProtocolType, Stage, TransitionExecutor, TransitionOutcome, UserId, WorkflowRegistry,
};
use protocol_workflow::store::{ProtocolFilter, ProtocolStore, SnapshotFile};
use protocol_workflow::telemetry::init_telemetry;

#[derive(Parser)]
#[command(name = "protocolo")]
#[command(about = "Protocol approval workflows for member assemblies")]
#[command(version = "0.1.0")]
struct Cli {
    /// Act as this user (UUID); unattended system actor when omitted
    #[arg(long, global = true)]
    user: Option<UserId>,
    /// Use the SQLite database instead of the JSON snapshot
    #[arg(long, global = true)]
    database: bool,
    /// Assembly (org unit) UUID owning the protocol number, needed when
    /// several assemblies use the same number
    #[arg(long, global = true)]
    assembly: Option<OrgUnitId>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the workflow steps of each protocol type
    Steps {
        /// Only this protocol type (e.g. leave_of_absence, INIC)
        protocol_type: Option<ProtocolType>,
    },
    /// Open a new protocol
    Create {
        /// Protocol type (e.g. initiation, transfer, AFST)
        protocol_type: ProtocolType,
        /// Short title of the request
        title: String,
        #[arg(long, help = "Assembly (org unit) UUID")]
        org: OrgUnitId,
        #[arg(long, help = "Requesting user UUID; defaults to --user")]
        requester: Option<UserId>,
        #[arg(long, help = "Member the protocol is about")]
        member: Option<MemberId>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, help = "Type-specific data as a JSON object")]
        payload: Option<String>,
    },
    /// List protocols
    List {
        #[arg(long)]
        org: Option<OrgUnitId>,
        #[arg(long = "type")]
        protocol_type: Option<ProtocolType>,
        #[arg(long)]
        stage: Option<Stage>,
        #[arg(long, help = "Include completed, rejected and cancelled protocols")]
        all: bool,
        #[arg(long)]
        archived: bool,
    },
    /// Show one protocol
    Show {
        /// Protocol number, e.g. AFST-2025-0004
        number: ProtocolNumber,
        #[arg(long, help = "Print the raw JSON record")]
        json: bool,
    },
    /// Move a protocol to the next stage of its workflow
    Advance {
        number: ProtocolNumber,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Move a protocol to an explicit stage
    Transition {
        number: ProtocolNumber,
        /// Target stage (e.g. pending_approval, completed)
        stage: Stage,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Define the fee of a protocol awaiting fee definition
    Fee {
        number: ProtocolNumber,
        /// Amount, e.g. 150.00
        amount: Decimal,
    },
    /// Register payment and move on from the payment stage
    Pay {
        number: ProtocolNumber,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Reject a protocol with feedback for the requester
    Reject {
        number: ProtocolNumber,
        /// Reason shown to the requester
        reason: String,
    },
    /// Cancel a protocol
    Cancel {
        number: ProtocolNumber,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Change payload fields (KEY=JSON, null removes the key)
    Edit {
        number: ProtocolNumber,
        #[arg(long = "set", required = true)]
        fields: Vec<String>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Archive a protocol, keeping its history
    Archive {
        number: ProtocolNumber,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Show the audit trail of a protocol
    Timeline {
        number: ProtocolNumber,
        #[arg(long, help = "Newest entries first")]
        newest_first: bool,
        #[arg(long, help = "Only entries with this action (e.g. payment)")]
        action: Option<AuditAction>,
        #[arg(long)]
        json: bool,
    },
    /// Cancel abandoned drafts and report overdue protocols
    Sweep {
        #[arg(long, help = "Only report, do not cancel drafts")]
        report_only: bool,
    },
    /// Member directory
    Member {
        #[command(subcommand)]
        command: MemberCommands,
    },
    /// Configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum MemberCommands {
    /// Register a member
    Add {
        name: String,
        national_id: String,
        #[arg(long)]
        org: OrgUnitId,
        #[arg(long, help = "Birth date (YYYY-MM-DD)")]
        birth_date: Option<NaiveDate>,
        #[arg(long)]
        email: Option<String>,
    },
    /// List members
    List {
        #[arg(long)]
        org: Option<OrgUnitId>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Write the effective configuration to a file
    Save {
        #[arg(default_value = "protocol-workflow.toml")]
        path: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config()?;
    init_telemetry(&config.observability)?;
    let (user, database, assembly) = (cli.user, cli.database, cli.assembly);

    match cli.command {
        Commands::Steps { protocol_type } => steps_command(config, protocol_type),
        Commands::Config { command } => config_command(config, command),
        command => tokio::runtime::Runtime::new()?
            .block_on(async move { run_with_store(config, user, database, assembly, command).await }),
    }
}

fn steps_command(config: &ProtocolWorkflowConfig, only: Option<ProtocolType>) -> Result<()> {
    let registry = config.workflow_registry()?;
    let types = match only {
        Some(protocol_type) => vec![protocol_type],
        None => registry.protocol_types(),
    };

    println!("📋 WORKFLOWS");
    println!("============");
    for protocol_type in types {
        let steps = registry.all_steps(protocol_type)?;
        println!();
        println!("{} ({}, {})", protocol_type.label(), protocol_type, protocol_type.prefix());
        for (index, stage) in steps.iter().enumerate() {
            println!("  {}. {} [{}]", index + 1, stage.label(), stage);
        }
    }
    Ok(())
}

fn config_command(config: &ProtocolWorkflowConfig, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigCommands::Save { path } => {
            config.save_to_file(&path)?;
            println!("✅ Configuration written to {path}");
        }
    }
    Ok(())
}

fn build_executor(
    config: &ProtocolWorkflowConfig,
    store: Arc<dyn ProtocolStore>,
    members: Arc<dyn MemberDirectory>,
) -> Result<TransitionExecutor> {
    let registry: WorkflowRegistry = config.workflow_registry()?;
    Ok(TransitionExecutor::new(store, members, registry)
        .with_numbering(config.numbering.policy())
        .with_money_format(config.money.clone()))
}

async fn run_with_store(
    config: &ProtocolWorkflowConfig,
    user: Option<UserId>,
    database: bool,
    assembly: Option<OrgUnitId>,
    command: Commands,
) -> Result<()> {
    let actor = user.map(Actor::User).unwrap_or(Actor::System);

    if database {
        return run_with_database(config, actor, assembly, command).await;
    }

    let snapshot = SnapshotFile::new(&config.store.snapshot_path);
    let mut lock = snapshot.lock()?;
    let _guard = lock.try_write().map_err(|e| StoreError::Lock {
        reason: format!("{} is in use by another protocolo process ({e})", snapshot.path().display()),
    })?;

    let store = Arc::new(snapshot.load().await?);
    let executor = build_executor(config, store.clone(), store.clone())?;
    let result = execute(&executor, config, actor, assembly, command).await;

    // failed completions still leave audit entries behind
    snapshot.save(&store).await?;
    result
}

#[cfg(feature = "database")]
async fn run_with_database(
    config: &ProtocolWorkflowConfig,
    actor: Actor,
    assembly: Option<OrgUnitId>,
    command: Commands,
) -> Result<()> {
    use protocol_workflow::store::SqliteStore;

    let settings = config.database.clone().unwrap_or_default();
    let store = Arc::new(
        SqliteStore::connect(&settings.url, settings.max_connections, settings.auto_migrate).await?,
    );
    let executor = build_executor(config, store.clone(), store)?;
    execute(&executor, config, actor, assembly, command).await
}

#[cfg(not(feature = "database"))]
async fn run_with_database(
    _config: &ProtocolWorkflowConfig,
    _actor: Actor,
    _assembly: Option<OrgUnitId>,
    _command: Commands,
) -> Result<()> {
    bail!("protocolo was built without the `database` feature")
}

async fn execute(
    executor: &TransitionExecutor,
    config: &ProtocolWorkflowConfig,
    actor: Actor,
    assembly: Option<OrgUnitId>,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Create {
            protocol_type,
            title,
            org,
            requester,
            member,
            description,
            payload,
        } => {
            let requester = requester
                .or(actor.user_id())
                .ok_or_else(|| anyhow!("--requester is required when no --user is given"))?;
            let mut input = NewProtocol::new(protocol_type, title, org, requester);
            if let Some(member) = member {
                input = input.with_member(member);
            }
            if let Some(description) = description {
                input = input.with_description(description);
            }
            if let Some(payload) = payload {
                input = input.with_payload(parse_object(&payload)?);
            }
            let protocol = executor.create(input, actor).await?;
            println!("✅ Created {}", protocol.number);
            print_protocol(&protocol);
        }
        Commands::List {
            org,
            protocol_type,
            stage,
            all,
            archived,
        } => {
            let filter = ProtocolFilter {
                org_unit: org,
                protocol_type,
                stage,
                number: None,
                open_only: !all,
                include_archived: archived,
            };
            let protocols = executor.list(&filter).await?;
            if protocols.is_empty() {
                println!("📭 No protocols found");
            }
            for protocol in protocols {
                println!(
                    "{:<16} {:<22} {:<22} {}",
                    protocol.number,
                    protocol.stage.label(),
                    protocol.status.label(),
                    protocol.title
                );
            }
        }
        Commands::Show { number, json } => {
            let protocol = executor.find(&number, assembly).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&protocol)?);
            } else {
                print_protocol(&protocol);
            }
        }
        Commands::Advance { number, comment } => {
            let protocol = executor.find(&number, assembly).await?;
            let outcome = executor.advance(protocol.id, actor, comment).await?;
            print_outcome(&outcome);
        }
        Commands::Transition { number, stage, comment } => {
            let protocol = executor.find(&number, assembly).await?;
            let outcome = executor
                .transition(protocol.id, stage, actor, comment)
                .await?;
            print_outcome(&outcome);
        }
        Commands::Fee { number, amount } => {
            let protocol = executor.find(&number, assembly).await?;
            let updated = executor.define_fee(protocol.id, amount, actor).await?;
            println!(
                "💰 Fee of {} set on {}",
                executor.audit().money().format(amount),
                updated.number
            );
        }
        Commands::Pay { number, comment } => {
            let protocol = executor.find(&number, assembly).await?;
            let outcome = executor.register_payment(protocol.id, actor, comment).await?;
            print_outcome(&outcome);
        }
        Commands::Reject { number, reason } => {
            let protocol = executor.find(&number, assembly).await?;
            let outcome = executor.reject(protocol.id, &reason, actor).await?;
            print_outcome(&outcome);
        }
        Commands::Cancel { number, comment } => {
            let protocol = executor.find(&number, assembly).await?;
            let outcome = executor.cancel(protocol.id, actor, comment).await?;
            print_outcome(&outcome);
        }
        Commands::Edit { number, fields, comment } => {
            let protocol = executor.find(&number, assembly).await?;
            let mut changes = Map::new();
            for field in &fields {
                let (key, value) = parse_field(field)?;
                changes.insert(key, value);
            }
            let updated = executor.update_payload(protocol.id, changes, actor, comment).await?;
            println!("✏️  {} updated ({})", updated.number, updated.status.label());
        }
        Commands::Archive { number, comment } => {
            let protocol = executor.find(&number, assembly).await?;
            let archived = executor.archive(protocol.id, actor, comment).await?;
            println!("🗄️  {} archived", archived.number);
        }
        Commands::Timeline {
            number,
            newest_first,
            action,
            json,
        } => {
            let protocol = executor.find(&number, assembly).await?;
            let timeline = executor.history(protocol.id, actor, newest_first).await?;
            let entries: Vec<_> = match action {
                Some(action) => timeline.by_action(action).collect(),
                None => timeline.iter().collect(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("🕑 {} ({} entries)", protocol.number, entries.len());
                for entry in entries {
                    let who = if entry.system_initiated {
                        "sistema".to_string()
                    } else {
                        entry.user.to_string()
                    };
                    println!(
                        "  {} [{}] {} ({})",
                        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.action.label(),
                        entry.description,
                        who
                    );
                    if let Some(comment) = &entry.comment {
                        println!("      💬 {comment}");
                    }
                }
            }
        }
        Commands::Sweep { report_only } => {
            let now = Utc::now();
            if !report_only {
                let max_age = chrono::Duration::days(config.sweeps.draft_max_age_days);
                let report = cancel_abandoned_drafts(executor, now, max_age).await?;
                println!(
                    "🧹 Drafts examined: {}, cancelled: {}",
                    report.examined,
                    report.cancelled.len()
                );
                for number in &report.cancelled {
                    println!("   ❌ {number}");
                }
                for (number, reason) in &report.failed {
                    println!("   ⚠️  {number}: {reason}");
                }
            }
            let sla = chrono::Duration::days(config.sweeps.stage_sla_days);
            let overdue = overdue_protocols(executor, now, sla).await?;
            if overdue.is_empty() {
                println!("✅ No overdue protocols");
            } else {
                println!("⏰ Overdue protocols:");
                for item in overdue {
                    println!(
                        "   {} in {} since {} ({} days over)",
                        item.number,
                        item.stage.label(),
                        item.since.format("%Y-%m-%d"),
                        item.overdue_days
                    );
                }
            }
        }
        Commands::Member { command } => member_command(executor.members().as_ref(), command).await?,
        Commands::Steps { .. } | Commands::Config { .. } => {
            bail!("command does not use the protocol store")
        }
    }
    Ok(())
}

async fn member_command(members: &dyn MemberDirectory, command: MemberCommands) -> Result<()> {
    match command {
        MemberCommands::Add {
            name,
            national_id,
            org,
            birth_date,
            email,
        } => {
            let created = members
                .create_members(&[NewMember {
                    org_unit: org,
                    name,
                    national_id,
                    birth_date,
                    email,
                }])
                .await?;
            for member in created {
                println!("✅ Member {} registered as {}", member.name, member.id);
            }
        }
        MemberCommands::List { org } => {
            let list = members.list_members(org).await?;
            if list.is_empty() {
                println!("📭 No members found");
            }
            for member in list {
                let state = if member.active { "🟢" } else { "⚪" };
                println!("{} {} {:<32} {}", state, member.id, member.name, member.national_id);
            }
        }
    }
    Ok(())
}

fn parse_object(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map),
        _ => bail!("payload must be a JSON object"),
    }
}

/// `key=value`; values that are not valid JSON are taken as strings
fn parse_field(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{raw}'"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn print_protocol(protocol: &Protocol) {
    println!("📄 {} - {}", protocol.number, protocol.title);
    println!("   Type:    {}", protocol.protocol_type.label());
    println!("   Stage:   {}", protocol.stage.label());
    println!("   Status:  {}", protocol.status.label());
    println!("   Version: {}", protocol.version);
    if let Some(fee) = protocol.fee {
        println!("   Fee:     {fee}");
    }
    if let Some(feedback) = &protocol.rejection_feedback {
        println!("   Feedback: {feedback}");
    }
    if protocol.is_archived() {
        println!("   🗄️  archived");
    }
}

fn print_outcome(outcome: &TransitionOutcome) {
    println!(
        "➡️  {}: {} → {}",
        outcome.protocol.number,
        outcome.from.label(),
        outcome.to.label()
    );
    if let Some(report) = &outcome.side_effects {
        let icon = if report.is_failure() { "⚠️ " } else { "✅" };
        println!("{icon} Side effects: {report}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_accepts_json_and_plain_strings() {
        assert_eq!(parse_field("count=3").unwrap(), ("count".to_string(), Value::from(3)));
        assert_eq!(
            parse_field("reason=mudança").unwrap(),
            ("reason".to_string(), Value::String("mudança".to_string()))
        );
        assert_eq!(parse_field("old=null").unwrap().1, Value::Null);
        assert!(parse_field("missing").is_err());
    }

    #[test]
    fn test_payload_must_be_object() {
        assert!(parse_object(r#"{"members": []}"#).is_ok());
        assert!(parse_object("[1, 2]").is_err());
    }

    #[test]
    fn test_cli_parses_global_user() {
        let user = UserId::new();
        let cli = Cli::try_parse_from(["protocolo", "show", "AFST-2025-0004", "--user", &user.to_string()]).unwrap();
        assert_eq!(cli.user, Some(user));
        assert!(matches!(cli.command, Commands::Show { json: false, .. }));
    }
}
