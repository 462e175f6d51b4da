use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use analytics_pipeline::app::ports::SilverStorePort;
use analytics_pipeline::app::{RunContext, RunStatus, SilverUseCase};
use analytics_pipeline::config::Config;
use analytics_pipeline::infra::FsSilverStore;
use analytics_pipeline::{logging, observability};

#[derive(Parser)]
#[command(name = "analytics_pipeline")]
#[command(about = "Bronze to Silver transformation and deduplication")]
#[command(version = "0.1.0")]
struct Cli {
    /// Config file (defaults to ./config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build one Silver partition from Bronze inputs
    Transform {
        /// Silver partition id (defaults to silver_<run start timestamp>)
        #[arg(long)]
        partition_id: Option<String>,
        /// Write Prometheus metrics to this file when the run ends
        #[arg(long)]
        metrics_out: Option<PathBuf>,
        /// Bronze partition directories or files (defaults to every partition under paths.bronze_dir)
        inputs: Vec<PathBuf>,
    },
    /// List committed Silver partitions
    Partitions,
    /// Print a partition's manifest
    Show {
        partition_id: String,
        /// Also print the rejection report
        #[arg(long)]
        rejections: bool,
    },
}

/// Every Bronze partition directory under `bronze_dir`, or `bronze_dir` itself when it has none
fn default_inputs(bronze_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(bronze_dir)
        .with_context(|| format!("Failed to list Bronze directory {}", bronze_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_dir()
                && !p
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with('.'))
                    .unwrap_or(false)
        })
        .collect();
    dirs.sort();
    if dirs.is_empty() {
        dirs.push(bronze_dir.to_path_buf());
    }
    Ok(dirs)
}

async fn transform(
    config: Config,
    partition_id: Option<String>,
    metrics_out: Option<PathBuf>,
    inputs: Vec<PathBuf>,
) -> Result<i32> {
    let metrics_handle = match observability::init() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Metrics disabled: {}", e);
            None
        }
    };

    let config = Arc::new(config);
    let inputs = if inputs.is_empty() {
        default_inputs(&config.paths.bronze_dir)?
    } else {
        inputs
    };

    let store = FsSilverStore::new(config.paths.silver_dir.clone());
    let use_case = SilverUseCase::new(&config, Box::new(store))?;
    let ctx = RunContext::new(config.clone(), partition_id)?;

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancellation requested, rolling back before publish");
            cancel.cancel();
        }
    });

    info!(run_id = %ctx.run_id, partition_id = %ctx.partition_id, inputs = inputs.len(), "Starting Silver run");
    let result = use_case.run(&ctx, &inputs).await;

    if let (Some(handle), Some(path)) = (&metrics_handle, &metrics_out) {
        fs::write(path, handle.render())
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    }

    match result {
        Ok(report) => {
            let c = &report.counts;
            println!("\n📊 Silver partition {}:", report.manifest.partition_id);
            println!("   Status: {}", report.status.as_str());
            println!("   Files read: {} (skipped {})", c.files_read, c.files_malformed);
            println!("   Records read: {}", c.read);
            println!("   Normalized: {} (failed {})", c.normalized, c.normalize_failed);
            println!("   Deduplicated: {} (collapsed {})", c.deduplicated, c.duplicates_collapsed);
            println!("   Accepted: {}", c.accepted);
            println!("   Rejected: {}", c.rejected);

            for bad in &report.malformed {
                println!("   ⚠️  skipped {}: {}", bad.locator, bad.reason);
            }
            Ok(report.status.exit_code())
        }
        Err(e) => {
            error!(run_id = %ctx.run_id, error = %e, "Silver run failed");
            eprintln!("❌ Silver run failed: {}", e);
            Ok(RunStatus::Failure.exit_code())
        }
    }
}

async fn execute(cli: Cli) -> Result<i32> {
    let config = Config::load_or_default(cli.config.as_deref()).context("Failed to load configuration")?;
    let _guard = logging::init_logging(&config.paths.log_dir);

    match cli.command {
        Commands::Transform {
            partition_id,
            metrics_out,
            inputs,
        } => transform(config, partition_id, metrics_out, inputs).await,
        Commands::Partitions => {
            let store = FsSilverStore::new(config.paths.silver_dir.clone());
            let manifests = store.list().await?;
            if manifests.is_empty() {
                println!("No Silver partitions in {}", store.root().display());
            }
            for m in manifests {
                println!(
                    "{}\t{}\trecords={}\trejected={}",
                    m.partition_id,
                    m.created_at.to_rfc3339(),
                    m.record_count,
                    m.rejected_count
                );
            }
            Ok(0)
        }
        Commands::Show {
            partition_id,
            rejections,
        } => {
            let store = FsSilverStore::new(config.paths.silver_dir.clone());
            let partition = store
                .read_partition(&partition_id)
                .await
                .with_context(|| format!("Failed to read partition {}", partition_id))?;
            println!("{}", serde_json::to_string_pretty(&partition.manifest)?);
            if rejections {
                for entry in store.read_rejections(&partition_id).await? {
                    println!("{}", serde_json::to_string(&entry)?);
                }
            }
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            RunStatus::Failure.exit_code()
        }
    };
    std::process::exit(code);
}
