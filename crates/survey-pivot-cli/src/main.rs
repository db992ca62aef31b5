use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use survey_pivot_api::{SurveyPivotApi, TableModel};
use survey_pivot_core::{CategoryView, Selection};
use survey_pivot_store::{load_record_store, DataSources, SourceLocation};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "sp")]
#[command(about = "Survey Pivot CLI")]
struct Cli {
    /// Directory or base URL holding summary_stats.json and metadata.json.
    #[arg(long, default_value = "./data")]
    data: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dataset summary: sample size, demographics, category sizes, snapshot id.
    Metadata,
    /// Group order for a selection.
    Groups(SelectionArgs),
    /// Pivoted rows for a selection.
    View(ViewArgs),
    /// Mismatches between the records and the metadata descriptor.
    Drift,
}

#[derive(Debug, Args)]
struct SelectionArgs {
    #[arg(long, default_value = survey_pivot_core::OVERALL_DEMOGRAPHIC)]
    demographic: String,
    #[arg(long, value_enum, default_value_t = ViewArg::Items)]
    view: ViewArg,
}

#[derive(Debug, Args)]
struct ViewArgs {
    #[command(flatten)]
    selection: SelectionArgs,
    #[arg(long, value_enum, default_value_t = FormatArg::Json)]
    format: FormatArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ViewArg {
    Items,
    Scales,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Flat,
    Table,
}

impl From<ViewArg> for CategoryView {
    fn from(value: ViewArg) -> Self {
        match value {
            ViewArg::Items => Self::Items,
            ViewArg::Scales => Self::Scales,
        }
    }
}

impl SelectionArgs {
    fn to_selection(&self) -> Selection {
        Selection::new(self.demographic.clone(), self.view.into())
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let sources = DataSources::relative_to(&SourceLocation::parse(&cli.data));
    let store = load_record_store(&sources)
        .await
        .with_context(|| format!("failed to load survey data from {}", cli.data))?;
    let api = SurveyPivotApi::new(Arc::new(store));

    match cli.command {
        Command::Metadata => run_metadata(&api),
        Command::Groups(args) => run_groups(&api, &args),
        Command::View(args) => run_view(&api, &args),
        Command::Drift => run_drift(&api),
    }
}

fn run_metadata(api: &SurveyPivotApi) -> Result<()> {
    emit_json(serde_json::to_value(api.metadata_summary())?)
}

fn run_groups(api: &SurveyPivotApi, args: &SelectionArgs) -> Result<()> {
    let selection = args.to_selection();
    let groups = api.groups(&selection);
    emit_json(serde_json::json!({
        "demographic": selection.demographic,
        "view": selection.view,
        "groups": groups
    }))
}

fn run_view(api: &SurveyPivotApi, args: &ViewArgs) -> Result<()> {
    let view = api.view(&args.selection.to_selection());
    match args.format {
        FormatArg::Json => emit_json(serde_json::to_value(&view)?),
        FormatArg::Flat => {
            let rows = view.flat_rows();
            emit_json(serde_json::json!({
                "demographic": view.demographic,
                "view": view.view,
                "groups": view.groups,
                "rows": rows
            }))
        }
        FormatArg::Table => {
            println!("{}", TableModel::from_view(&view).render_text());
            Ok(())
        }
    }
}

fn run_drift(api: &SurveyPivotApi) -> Result<()> {
    let drift = api.drift();
    let mut value = serde_json::to_value(drift)?;
    if let Value::Object(object) = &mut value {
        object.insert("clean".to_string(), Value::Bool(drift.is_clean()));
    }
    emit_json(value)
}
