use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use cxr_db_api::{BrowseRequest, BrowserApi, BrowserConfig, RandomRequest};
use cxr_db_core::{encode_query, FilterState, ImageId, ViewFilter};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "cxr")]
#[command(about = "CXR Database CLI")]
struct Cli {
    #[arg(long, default_value = "./sample/sample_labels.csv")]
    csv: PathBuf,

    #[arg(long, default_value = "./sample/images")]
    images: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve one record the way a page load with these query parameters would.
    Browse(BrowseArgs),
    /// List the finding vocabulary.
    Findings,
    /// Summarize the metadata table.
    Dataset,
}

#[derive(Debug, Args)]
struct BrowseArgs {
    #[arg(long)]
    file: Option<String>,
    #[arg(long = "finding")]
    findings: Vec<String>,
    #[arg(long, value_enum)]
    view_position: Option<ViewPositionArg>,
    /// Ignore `--file` and draw a fresh record from the filters.
    #[arg(long, default_value_t = false)]
    random: bool,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ViewPositionArg {
    Any,
    Pa,
    Ap,
}

impl From<ViewPositionArg> for ViewFilter {
    fn from(value: ViewPositionArg) -> Self {
        match value {
            ViewPositionArg::Any => Self::Any,
            ViewPositionArg::Pa => Self::PosteroAnterior,
            ViewPositionArg::Ap => Self::AnteroPosterior,
        }
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

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = BrowserConfig::new(cli.csv, cli.images);
    match cli.command {
        Command::Browse(args) => run_browse(config, args),
        Command::Findings => run_findings(&BrowserApi::new(config)),
        Command::Dataset => run_dataset(&BrowserApi::new(config)),
    }
}

fn run_browse(config: BrowserConfig, args: BrowseArgs) -> Result<()> {
    let api = match args.seed {
        Some(seed) => BrowserApi::with_rng(config, StdRng::seed_from_u64(seed)),
        None => BrowserApi::new(config),
    };
    let view_position = args.view_position.map(ViewFilter::from);
    let findings = args.findings.into_iter().collect::<BTreeSet<_>>();

    let result = if args.random {
        api.random(
            None,
            RandomRequest { view_position: view_position.unwrap_or_default(), findings },
        )?
    } else {
        let filter = FilterState { view_position, findings, pinned: args.file.map(ImageId::new) };
        api.browse(BrowseRequest {
            session_id: None,
            query: encode_query(&filter),
            actions: Vec::new(),
        })?
    };
    tracing::debug!(status = ?result.status, filtered_count = result.filtered_count, "browse");
    emit_json(serde_json::to_value(result)?)
}

fn run_findings(api: &BrowserApi) -> Result<()> {
    let findings = api.findings()?;
    emit_json(serde_json::json!({ "findings": findings }))
}

fn run_dataset(api: &BrowserApi) -> Result<()> {
    let summary = api.dataset_summary()?;
    emit_json(serde_json::to_value(summary)?)
}
