//! permgate command-line tool
//!
//! Validates policy files and runs checks, query trimming and masking against
//! them without a host application.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use permgate_common::config::EngineConfig;
use permgate_common::types::{Condition, Operation, PermissionConfig, SecurityContext, UserContext};
use permgate_engine::{
    condition_to_filter, Formula, PermissionEngine, Query, QueryHookContext, QueryOutput,
    ResultHookContext, RuleCompiler,
};
use permgate_store::StorageBackends;

#[derive(Parser, Debug)]
#[command(name = "permgate")]
#[command(about = "Declarative permission engine tooling", long_about = None)]
struct Cli {
    /// Path to engine configuration file
    #[arg(short, long, default_value = "engine.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile every policy and report conditions that cannot be used
    Validate {
        #[arg(long)]
        policies: PathBuf,
    },
    /// Decide a single permission check
    Check {
        #[arg(long)]
        policies: PathBuf,
        #[arg(long)]
        object: String,
        #[arg(long, value_parser = parse_operation)]
        operation: Operation,
        #[command(flatten)]
        user: UserArgs,
        #[arg(long)]
        field: Option<String>,
        /// Record the check applies to, as JSON
        #[arg(long)]
        record: Option<String>,
    },
    /// Print the filter injected into a query on the object
    Filter {
        #[arg(long)]
        policies: PathBuf,
        #[arg(long)]
        object: String,
        #[command(flatten)]
        user: UserArgs,
    },
    /// Apply field-level security to records read from a JSON file
    Mask {
        #[arg(long)]
        policies: PathBuf,
        #[arg(long)]
        object: String,
        /// JSON array of records, or a single record
        #[arg(long)]
        records: PathBuf,
        #[command(flatten)]
        user: UserArgs,
    },
}

#[derive(Args, Debug, Default)]
struct UserArgs {
    /// Acting user id; omit for an anonymous request
    #[arg(long)]
    user_id: Option<String>,

    /// Comma-separated roles
    #[arg(long, value_delimiter = ',')]
    roles: Vec<String>,

    /// Extra user attribute as key=value (value parsed as JSON when possible)
    #[arg(long = "attr", value_parser = parse_attribute)]
    attributes: Vec<(String, Value)>,
}

impl UserArgs {
    fn user(&self) -> Option<UserContext> {
        self.user_id.as_ref().map(|id| {
            let mut user = UserContext {
                id: id.clone(),
                roles: self.roles.clone(),
                ..Default::default()
            };
            for (key, value) in &self.attributes {
                user.attributes.insert(key.clone(), value.clone());
            }
            user
        })
    }
}

fn parse_operation(s: &str) -> Result<Operation, String> {
    Operation::parse(s).ok_or_else(|| format!("unknown operation '{s}'"))
}

fn parse_attribute(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn read_policies(path: &Path) -> anyhow::Result<Vec<PermissionConfig>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading policies from {}", path.display()))?;
    let policies: Vec<PermissionConfig> = serde_json::from_str(&content)
        .with_context(|| format!("parsing policies in {}", path.display()))?;
    Ok(policies)
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    } else {
        info!("Using default configuration");
        Ok(EngineConfig::default())
    }
}

async fn build_engine(mut config: EngineConfig, policies: &Path) -> anyhow::Result<PermissionEngine> {
    config.permissions.extend(read_policies(policies)?);
    Ok(PermissionEngine::new(config, StorageBackends::default()).await?)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Every condition in a policy with a label saying where it lives
fn labelled_conditions(config: &PermissionConfig) -> Vec<(String, &Condition)> {
    let mut out = Vec::new();
    for rule in &config.record_rules {
        if let Some(condition) = &rule.condition {
            out.push((format!("record rule '{}'", rule.name), condition));
        }
    }
    if let Some(rls) = &config.row_level_security {
        if let Some(condition) = &rls.default_rule {
            out.push(("row-level security default rule".to_string(), condition));
        }
        for exception in &rls.exceptions {
            if let Some(condition) = &exception.condition {
                out.push((format!("row-level security exception for '{}'", exception.role), condition));
            }
        }
    }
    out
}

fn formula_errors(condition: &Condition) -> Vec<String> {
    match condition {
        Condition::Formula { formula } => Formula::parse(formula)
            .err()
            .map(|e| vec![format!("'{formula}': {e}")])
            .unwrap_or_default(),
        Condition::Lookup {
            condition: Some(inner),
            ..
        } => formula_errors(inner),
        _ => Vec::new(),
    }
}

fn validate(policies: &[PermissionConfig]) -> anyhow::Result<()> {
    let mut problems = 0;
    for config in policies {
        let rules = RuleCompiler::compile(config);
        info!("{}: compiled {} rules", config.object, rules.iter().count());

        for (label, condition) in labelled_conditions(config) {
            for error in formula_errors(condition) {
                problems += 1;
                println!("error: {} {}: {}", config.object, label, error);
            }
            if let Err(e) = condition_to_filter(condition, None) {
                warn!("{} {} is evaluated in memory: {}", config.object, label, e);
                println!("note: {} {} cannot be pushed to the data layer: {}", config.object, label, e);
            }
        }
    }

    if problems > 0 {
        bail!("{problems} problem(s) found in {} policies", policies.len());
    }
    println!("ok: {} policies", policies.len());
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Validate { policies } => validate(&read_policies(&policies)?),
        Command::Check {
            policies,
            object,
            operation,
            user,
            field,
            record,
        } => {
            let engine = build_engine(config, &policies).await?;
            let mut ctx = SecurityContext::new(&object, operation);
            ctx.user = user.user();
            ctx.field = field;
            if let Some(record) = record {
                ctx.record = Some(serde_json::from_str(&record).context("parsing --record")?);
            }
            print_json(&engine.check_permission(&ctx).await)
        }
        Command::Filter { policies, object, user } => {
            let engine = build_engine(config, &policies).await?;
            let mut hook = QueryHookContext::new(&object, Query::new());
            hook.user = user.user();
            engine.before_query(&mut hook).await?;
            print_json(&serde_json::json!({
                "filters": hook.query.filter_document(),
                "skip": hook.skip,
                "residual_clauses": hook.query.residual.len(),
            }))
        }
        Command::Mask {
            policies,
            object,
            records,
            user,
        } => {
            let engine = build_engine(config, &policies).await?;
            let content = std::fs::read_to_string(&records)
                .with_context(|| format!("reading records from {}", records.display()))?;
            let output = match serde_json::from_str::<Value>(&content)? {
                Value::Array(items) => QueryOutput::Many(items),
                single => QueryOutput::One(single),
            };
            let mut hook = ResultHookContext::new(&object, output);
            hook.user = user.user();
            engine.after_query(&mut hook).await?;
            match hook.result {
                QueryOutput::Many(items) => print_json(&items),
                QueryOutput::One(item) => print_json(&item),
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays machine-readable
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    info!("permgate v{}", env!("CARGO_PKG_VERSION"));

    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn policy_file(policies: &Value) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(policies.to_string().as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_check_command() {
        let cli = Cli::try_parse_from([
            "permgate",
            "check",
            "--policies",
            "p.json",
            "--object",
            "accounts",
            "--operation",
            "read",
            "--user-id",
            "u1",
            "--roles",
            "member,admin",
            "--attr",
            "tenant=\"t1\"",
            "--attr",
            "level=3",
        ])
        .unwrap();

        let Command::Check { operation, user, .. } = cli.command else {
            panic!("expected check");
        };
        assert_eq!(operation, Operation::Read);
        let user = user.user().unwrap();
        assert_eq!(user.roles, vec!["member".to_string(), "admin".to_string()]);
        assert_eq!(user.attributes["tenant"], json!("t1"));
        assert_eq!(user.attributes["level"], json!(3));
    }

    #[test]
    fn test_rejects_unknown_operation() {
        assert!(Cli::try_parse_from([
            "permgate", "check", "--policies", "p.json", "--object", "a", "--operation", "publish",
        ])
        .is_err());
    }

    #[test]
    fn test_attribute_falls_back_to_string() {
        assert_eq!(parse_attribute("team=blue").unwrap(), ("team".to_string(), json!("blue")));
        assert!(parse_attribute("novalue").is_err());
    }

    #[test]
    fn test_validate_reports_bad_formulas() {
        let file = policy_file(&json!([{
            "object": "docs",
            "record_rules": [
                { "name": "ok", "condition": { "type": "formula", "formula": "owner == $current_user.id" }, "permissions": { "read": true } },
                { "name": "broken", "condition": { "type": "formula", "formula": "owner ==" }, "permissions": { "read": true } }
            ]
        }]));
        let policies = read_policies(file.path()).unwrap();
        assert!(validate(&policies).is_err());

        let good = policy_file(&json!([{ "object": "docs", "object_permissions": { "read": ["member"] } }]));
        assert!(validate(&read_policies(good.path()).unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_build_engine_seeds_policies() {
        let file = policy_file(&json!([{ "object": "docs", "object_permissions": { "read": ["member"] } }]));
        let engine = build_engine(EngineConfig::default(), file.path()).await.unwrap();
        let ctx = SecurityContext::new("docs", Operation::Read).with_user(UserContext::new("u1", &["guest"]));
        assert!(!engine.check_permission(&ctx).await.granted);
    }
}
