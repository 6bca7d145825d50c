use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use mimalloc::MiMalloc;
use ptn_engine::config::EngineConfig;
use ptn_engine::errors::{EngineError, Envelope};
use ptn_engine::models::association::{group_by_attack, group_by_host};
use ptn_engine::parsers::{read_scan_file, ScanType};
use ptn_engine::EngineState;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// M-MIMALLOC-APP: Use mimalloc as global allocator for improved performance.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// ptn-engine: import Nessus/Nmap results and correlate them with attacks
#[derive(Parser, Debug)]
#[command(name = "ptn-engine", version, about = "Scan ingestion and attack correlation")]
struct Args {
    /// Scan files to import, in order
    #[arg(value_name = "FILE", required = true, num_args = 1..)]
    files: Vec<PathBuf>,

    /// Project the files are imported into (default: DEFAULT_PROJECT)
    #[arg(short = 'p', long = "project", value_name = "NAME")]
    project: Option<String>,

    /// Attack catalog file (default: ATTACK_CATALOG_PATH)
    #[arg(short = 'c', long = "catalog", value_name = "PATH")]
    catalog: Option<PathBuf>,

    /// Declared scan type for every file; guessed from the extension when omitted
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    scan_type: Option<String>,

    /// Correlation time budget per import, in seconds
    #[arg(long = "deadline-secs", value_name = "SECS")]
    deadline_secs: Option<u64>,

    /// Print associations grouped by host or by attack after importing
    #[arg(short = 'g', long = "group-by", value_enum)]
    group_by: Option<GroupBy>,

    /// Print the project summary after importing
    #[arg(short = 's', long = "summary")]
    summary: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GroupBy {
    Host,
    Attack,
}

fn print_json<T: Serialize>(envelope: &Envelope<T>) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(envelope)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "ptn_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = EngineConfig::from_env();
    if let Some(path) = args.catalog {
        config.attack_catalog_path = path;
    }
    if let Some(secs) = args.deadline_secs {
        config.import_deadline = Some(std::time::Duration::from_secs(secs));
    }
    let project = args
        .project
        .unwrap_or_else(|| config.default_project.clone());

    let state = match EngineState::from_config(config) {
        Ok(state) => state,
        Err(e) => {
            print_json(&Envelope::<()>::failure(&e))?;
            anyhow::bail!(e);
        }
    };

    let mut failed = 0usize;
    for path in &args.files {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let declared = match &args.scan_type {
            Some(declared) => declared.clone(),
            None => match ScanType::from_file_name(&file_name) {
                Some(scan_type) => scan_type.to_string(),
                None => {
                    let err = EngineError::UnsupportedScanType(file_name.clone());
                    print_json(&Envelope::<()>::failure(&err))?;
                    failed += 1;
                    continue;
                }
            },
        };

        let data = match read_scan_file(path).await {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "Scan file unreadable");
                print_json(&Envelope::<()>::failure(&e))?;
                failed += 1;
                continue;
            }
        };
        let deadline = state
            .config
            .import_deadline
            .map(|budget| tokio::time::Instant::now() + budget);

        match state
            .orchestrator
            .import(&project, &file_name, data, &declared, deadline)
            .await
        {
            Ok(report) => print_json(&Envelope::success(report))?,
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "Import failed");
                print_json(&Envelope::<()>::failure(&e))?;
                failed += 1;
            }
        }
    }

    if let Some(group_by) = args.group_by {
        let associations = state.orchestrator.associations(&project).await;
        match group_by {
            GroupBy::Host => print_json(&Envelope::success(group_by_host(&associations)))?,
            GroupBy::Attack => print_json(&Envelope::success(group_by_attack(&associations)))?,
        }
    }

    if args.summary {
        let summary = state.orchestrator.summary(&project).await;
        print_json(&Envelope::success(summary))?;
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} imports failed", args.files.len());
    }
    Ok(())
}
