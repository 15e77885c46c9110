use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use iati_colab_api::{parse_params, ColabApi, ColabConfig, API_CONTRACT_VERSION};
use iati_colab_core::{parse_iso_date, RecordStore, ACTIVITY_ELEMENT};
use serde_json::Value;
use time::Date;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Parser)]
#[command(name = "iati")]
#[command(about = "IATI activity merging, currency classification, and scenario testing")]
struct Cli {
    /// YAML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `iati_colab_core=trace`. Falls back to `RUST_LOG`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Merge source documents into one.
    Merge(MergeArgs),
    /// Classify activities as current and write the classification log.
    Classify(ClassifyArgs),
    /// Ratio of selected items to activities.
    Coverage(CoverageArgs),
    /// Run one scenario test over every activity.
    Scenario(ScenarioArgs),
    /// List loaded scenarios and their tests.
    Scenarios(ScenariosArgs),
    /// Submit the merged document to the remote validator.
    Validate(ValidateArgs),
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// Source locator (URL, `file://` URL, or path); repeatable. Defaults to the configured sources.
    #[arg(long = "source")]
    sources: Vec<String>,
}

#[derive(Debug, Args)]
struct TodayArgs {
    /// Reference date (`YYYY-MM-DD`); defaults to the configured date, then today (UTC).
    #[arg(long)]
    today: Option<String>,
}

#[derive(Debug, Args)]
struct MergeArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ClassifyArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[command(flatten)]
    today: TodayArgs,
    /// Classification log CSV; defaults to the configured path.
    #[arg(long)]
    log: Option<PathBuf>,
    /// Write the current-only document here.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CoverageArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[command(flatten)]
    today: TodayArgs,
    #[arg(long)]
    select: String,
    /// Restrict the population to current activities.
    #[arg(long, default_value_t = false)]
    current: bool,
}

#[derive(Debug, Args)]
struct ScenarioArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[command(flatten)]
    today: TodayArgs,
    #[arg(long)]
    features: Option<PathBuf>,
    /// Case-insensitive prefix of the scenario file name.
    #[arg(long)]
    name: String,
    /// 1-based test ordinal.
    #[arg(long = "test")]
    ordinal: usize,
    #[arg(long, default_value = ACTIVITY_ELEMENT)]
    kind: String,
    /// `KEY=VALUE` parameter; repeatable.
    #[arg(long = "param")]
    params: Vec<String>,
    #[arg(long, default_value_t = false)]
    current: bool,
}

#[derive(Debug, Args)]
struct ScenariosArgs {
    #[command(flatten)]
    today: TodayArgs,
    #[arg(long)]
    features: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn log_filter(level: Option<&str>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::try_new(level).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    }
    .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_LEVEL))
}

fn init_logging(level: Option<&str>) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(log_filter(level))
        .with_writer(std::io::stderr)
        .try_init();
    if let Err(err) = installed {
        tracing::debug!(error = %err, "global subscriber already installed");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let config = ColabConfig::load_or_default(cli.config.as_deref())?;
    tracing::debug!(config = ?cli.config, sources = config.sources.len(), "configuration loaded");
    let api = ColabApi::new(config);
    match cli.command {
        Command::Merge(args) => run_merge(&api, &args),
        Command::Classify(args) => run_classify(&api, &args),
        Command::Coverage(args) => run_coverage(&api, &args),
        Command::Scenario(args) => run_scenario(&api, &args),
        Command::Scenarios(args) => run_scenarios(&api, &args),
        Command::Validate(args) => run_validate(&api, &args),
    }
}

fn resolve_today(api: &ColabApi, args: &TodayArgs) -> Result<Date> {
    match &args.today {
        Some(value) => parse_iso_date(value).with_context(|| format!("invalid --today `{value}`")),
        None => api.today(),
    }
}

/// Merge the sources, optionally narrowing to current activities.
fn load_store(api: &ColabApi, source: &SourceArgs, current: Option<Date>) -> Result<RecordStore> {
    let merged = api.merge(&source.sources)?;
    match current {
        Some(today) => Ok(api.classify(&merged.store, today, None)?.current),
        None => Ok(merged.store),
    }
}

fn run_merge(api: &ColabApi, args: &MergeArgs) -> Result<()> {
    let merged = api.merge(&args.source.sources)?;
    if let Some(out) = &args.out {
        api.write_document(&merged.store, out)?;
    }
    emit_json(serde_json::json!({
        "sources": merged.log.entries,
        "total": merged.log.total,
        "out": args.out
    }))
}

fn run_classify(api: &ColabApi, args: &ClassifyArgs) -> Result<()> {
    let today = resolve_today(api, &args.today)?;
    let merged = api.merge(&args.source.sources)?;
    let log = args.log.clone().unwrap_or_else(|| api.config().classification_log.clone());
    let classified = api.classify(&merged.store, today, Some(log.as_path()))?;
    if let Some(out) = &args.out {
        api.write_document(&classified.current, out)?;
    }
    let mut value = serde_json::to_value(&classified.summary)?;
    if let Value::Object(object) = &mut value {
        object.insert("out".to_string(), serde_json::to_value(&args.out)?);
    }
    emit_json(value)
}

fn run_coverage(api: &ColabApi, args: &CoverageArgs) -> Result<()> {
    let current = if args.current { Some(resolve_today(api, &args.today)?) } else { None };
    let store = load_store(api, &args.source, current)?;
    let coverage = api.coverage(&store, &args.select)?;
    emit_json(serde_json::json!({
        "select": args.select,
        "current_only": args.current,
        "denominator": coverage.denominator,
        "numerator": coverage.numerator,
        "coverage": coverage.coverage
    }))
}

fn run_scenario(api: &ColabApi, args: &ScenarioArgs) -> Result<()> {
    let today = resolve_today(api, &args.today)?;
    let params = parse_params(&args.params)?;
    let session = api.load_scenarios(args.features.as_deref(), today)?;
    let store = load_store(api, &args.source, args.current.then_some(today))?;
    let summary = api.run_scenario(&session, &args.name, args.ordinal, &store, &args.kind, &params)?;
    emit_json(serde_json::to_value(summary)?)
}

fn run_scenarios(api: &ColabApi, args: &ScenariosArgs) -> Result<()> {
    let today = resolve_today(api, &args.today)?;
    let session = api.load_scenarios(args.features.as_deref(), today)?;
    emit_json(serde_json::json!({
        "root": session.root(),
        "scenarios": api.list_scenarios(&session)
    }))
}

fn run_validate(api: &ColabApi, args: &ValidateArgs) -> Result<()> {
    let merged = api.merge(&args.source.sources)?;
    let summary = api.validate(&merged.store, args.endpoint.as_deref(), args.out_dir.as_deref())?;
    emit_json(serde_json::to_value(summary)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_falls_back_to_default_level() {
        let fallback = EnvFilter::new(DEFAULT_LOG_LEVEL).to_string();
        assert_eq!(log_filter(Some("debug")).to_string(), EnvFilter::new("debug").to_string());
        assert_ne!(log_filter(Some("debug")).to_string(), fallback);
        assert_eq!(log_filter(Some("iati_colab_core=loud")).to_string(), fallback);
    }

    #[test]
    fn init_logging_tolerates_an_installed_subscriber() {
        init_logging(Some("warn"));
        init_logging(Some("debug"));
    }

    #[test]
    fn output_carries_both_contract_versions() {
        let object = with_contract_version(serde_json::json!({ "total": 1 }));
        assert_eq!(object["contract_version"], CLI_CONTRACT_VERSION);
        assert_eq!(object["api_contract_version"], API_CONTRACT_VERSION);
        assert_eq!(object["total"], 1);

        let wrapped = with_contract_version(serde_json::json!([1, 2]));
        assert_eq!(wrapped["api_contract_version"], API_CONTRACT_VERSION);
        assert_eq!(wrapped["payload"], serde_json::json!([1, 2]));
    }
}
