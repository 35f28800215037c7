use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, error, trace};

use churnwise::features::parse_events;
use churnwise::logging::init_logging;
use churnwise::storage::{DatasetId, OrgId, StorageConfig};
use churnwise::{Algorithm, Pipeline, PipelineConfig};

/// Churn modeling for customer event histories
#[derive(Parser)]
#[command(name = "churnwise")]
#[command(about = "Derive churn features, train classifiers and score customers", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to a TOML configuration file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Store data under this directory with the file backend
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage organizations
    Org {
        #[command(subcommand)]
        command: OrgCommands,
    },
    /// Upload a raw events CSV for an organization
    Ingest {
        org_id: OrgId,
        /// CSV with customer_id and event_date columns
        file: PathBuf,
    },
    /// Show a dataset record
    Dataset { org_id: OrgId, dataset_id: DatasetId },
    /// Derive features from a raw dataset and wait for the stage to settle
    Features { org_id: OrgId, dataset_id: DatasetId },
    /// Train a model on the latest features and wait for the run to settle
    Train {
        org_id: OrgId,
        /// logistic_regression, random_forest or gradient_boosting
        #[arg(short, long)]
        algorithm: Option<String>,
    },
    /// Show the latest training run
    Status {
        org_id: OrgId,
        /// List every run instead, newest first
        #[arg(long)]
        history: bool,
    },
    /// Score one customer from an events CSV
    Predict {
        org_id: OrgId,
        customer_id: String,
        /// Every event in the file is attributed to the customer
        events: PathBuf,
    },
    /// Score every customer in the latest features dataset
    Score { org_id: OrgId },
}

#[derive(Subcommand)]
enum OrgCommands {
    /// Create an organization
    Create {
        name: String,
        /// Days of inactivity after which a customer counts as churned
        #[arg(long)]
        threshold_days: Option<u32>,
    },
    /// Show an organization
    Show { org_id: OrgId },
    /// Change an organization's churn threshold
    Threshold { org_id: OrgId, days: u32 },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    if let Err(e) = run(cli).await {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> anyhow::Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path).await?,
        None => PipelineConfig::default(),
    };
    config.merge_env_vars()?;
    if let Some(dir) = data_dir {
        config.storage = StorageConfig {
            connection_pool_size: config.storage.connection_pool_size,
            timeout: config.storage.timeout,
            ..StorageConfig::file(dir)
        };
    }
    debug!(backend = ?config.storage.backend, base_dir = %config.storage.base_dir.display(), "storage selected");
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref(), cli.data_dir).await?;
    let pipeline = Pipeline::new(config).await?;

    match cli.command {
        Commands::Org { command } => match command {
            OrgCommands::Create {
                name,
                threshold_days,
            } => print_json(&pipeline.create_organization(&name, threshold_days).await?),
            OrgCommands::Show { org_id } => print_json(&pipeline.get_organization(&org_id).await?),
            OrgCommands::Threshold { org_id, days } => {
                print_json(&pipeline.set_churn_threshold(&org_id, days).await?)
            }
        },
        Commands::Ingest { org_id, file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            print_json(&pipeline.ingest(&org_id, bytes).await?)
        }
        Commands::Dataset { org_id, dataset_id } => {
            print_json(&pipeline.get_dataset(&org_id, &dataset_id).await?)
        }
        Commands::Features { org_id, dataset_id } => {
            let handle = pipeline.run_feature_stage(&org_id, &dataset_id).await?;
            let dataset = handle.wait().await?;
            print_json(&dataset)?;
            if let Some(message) = &dataset.error_message {
                bail!("feature stage failed: {message}");
            }
            Ok(())
        }
        Commands::Train { org_id, algorithm } => {
            let algorithm = match algorithm {
                Some(name) => name.parse::<Algorithm>()?,
                None => pipeline.config().default_algorithm,
            };
            let ticket = pipeline.run_training_stage(&org_id, algorithm).await?;
            debug!(run_id = %ticket.run_id, "waiting for training run");
            ticket.handle.wait().await?;

            let report = pipeline.get_training_status(&org_id).await?;
            print_json(&report.view())?;
            if let Some(message) = report.run().and_then(|run| run.error_message()) {
                bail!("training failed: {message}");
            }
            Ok(())
        }
        Commands::Status { org_id, history } => {
            if history {
                print_json(&pipeline.training_history(&org_id).await?)
            } else {
                print_json(&pipeline.get_training_status(&org_id).await?.view())
            }
        }
        Commands::Predict {
            org_id,
            customer_id,
            events,
        } => {
            let bytes = tokio::fs::read(&events)
                .await
                .with_context(|| format!("Failed to read {}", events.display()))?;
            let table = parse_events(&bytes)?;
            print_json(&pipeline.predict(&org_id, &customer_id, &table.events).await?)
        }
        Commands::Score { org_id } => print_json(&pipeline.score_latest_features(&org_id).await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
