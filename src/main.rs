//! rt-push - push local export data to a remote destination.
//!
//! Reads entities, links and configuration records from JSON Lines files and
//! binary assets from a directory, then streams everything to the
//! destination over one transfer session.
//!
//! # Usage
//!
//! ```bash
//! rt-push --url https://cms.example.com --token $TOKEN \
//!     --entities export/entities.jsonl \
//!     --links export/links.jsonl \
//!     --configuration export/configuration.jsonl \
//!     --assets export/uploads
//!
//! # Token from the environment, destination from config.toml
//! export TRANSFER_TOKEN=...
//! rt-push --config ./config.toml --entities export/entities.jsonl
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use remote_transfer::config::AuthConfig;
use remote_transfer::{Asset, AssetWriter, ConfigFile, RemoteDestination, StepWriter};

#[derive(Parser, Debug)]
#[command(name = "rt-push", version, about = "Push data to a remote transfer destination")]
struct Args {
    /// Base URL of the destination (http or https)
    #[arg(long)]
    url: Option<String>,

    /// Transfer token, sent as a bearer token
    #[arg(long, env = "TRANSFER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Path to TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Entities, one JSON record per line
    #[arg(long)]
    entities: Option<PathBuf>,

    /// Links, one JSON record per line
    #[arg(long)]
    links: Option<PathBuf>,

    /// Configuration records, one JSON record per line
    #[arg(long)]
    configuration: Option<PathBuf>,

    /// Directory whose files are sent as assets
    #[arg(long)]
    assets: Option<PathBuf>,

    /// Batch flush threshold in bytes
    #[arg(long)]
    batch_size: Option<usize>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Default)]
struct Summary {
    entities: u64,
    links: u64,
    configuration: u64,
    assets: u64,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Config file first, then CLI flags on top
async fn load_config(args: &Args) -> Result<ConfigFile> {
    let mut config = match &args.config {
        Some(path) => ConfigFile::load(path).await?,
        None => match ConfigFile::default_path() {
            Some(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => {
                info!(path = %path.display(), "Using default config file");
                ConfigFile::load(&path).await?
            }
            _ => ConfigFile::default(),
        },
    };

    if let Some(url) = &args.url {
        config.url = Some(url.clone());
    }
    if let Some(token) = &args.token {
        config.auth = Some(AuthConfig {
            kind: "token".to_string(),
            token: Some(token.clone()),
        });
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = Some(batch_size);
    }
    Ok(config)
}

async fn push_records(mut writer: StepWriter, path: Option<&Path>) -> Result<u64> {
    let step = writer.step();

    if let Some(path) = path {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0usize;

        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?
        {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record: Value = serde_json::from_str(&line)
                .with_context(|| format!("{}:{}: invalid JSON record", path.display(), line_no))?;
            writer
                .write(&record)
                .await
                .with_context(|| {
                    format!(
                        "Failed to write {} record at {}:{} ({} written)",
                        step,
                        path.display(),
                        line_no,
                        writer.records_written()
                    )
                })?;
        }
    }

    writer
        .finish()
        .await
        .with_context(|| format!("Failed to end {} step", step))
}

/// Files under `root`, relative to it, in a stable order
async fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = vec![PathBuf::new()];

    while let Some(relative) = dirs.pop() {
        let dir = root.join(&relative);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read directory {}", dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = relative.join(entry.file_name());
            if file_type.is_dir() {
                dirs.push(path);
            } else if file_type.is_file() {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

async fn push_assets(mut writer: AssetWriter, root: Option<&Path>) -> Result<u64> {
    if let Some(root) = root {
        for relative in collect_files(root).await? {
            let asset = Asset::from_path(root, &relative)
                .await
                .with_context(|| format!("Failed to open asset {}", relative.display()))?;
            writer
                .write(asset)
                .await
                .with_context(|| format!("Failed to transfer asset {}", relative.display()))?;
            debug!(
                assets = writer.assets_written(),
                path = %relative.display(),
                "Asset sent"
            );
        }
    }

    writer.finish().await.context("Failed to end assets step")
}

async fn run_transfer(destination: &mut RemoteDestination, args: &Args) -> Result<Summary> {
    destination
        .bootstrap()
        .await
        .context("Failed to bootstrap remote destination")?;
    destination
        .before_transfer()
        .await
        .context("Remote beforeTransfer failed")?;

    let (entities, links, configuration, assets) = tokio::try_join!(
        push_records(
            destination.create_entities_writer()?,
            args.entities.as_deref()
        ),
        push_records(destination.create_links_writer()?, args.links.as_deref()),
        push_records(
            destination.create_configuration_writer()?,
            args.configuration.as_deref()
        ),
        push_assets(destination.create_assets_writer()?, args.assets.as_deref()),
    )?;

    Ok(Summary {
        entities,
        links,
        configuration,
        assets,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let options = load_config(&args)
        .await?
        .into_options()
        .context("Invalid configuration")?;
    let mut destination = RemoteDestination::new(options);

    let result = run_transfer(&mut destination, &args).await;

    if let Err(e) = &result {
        error!("Transfer failed: {:#}", e);
        if let Err(rollback) = destination.rollback().await {
            warn!(error = %rollback, "Rollback failed");
        }
    }

    let closed = destination.close().await;
    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            if let Err(close) = closed {
                warn!(error = %close, "Close failed");
            }
            return Err(e);
        }
    };
    closed.context("Failed to close transfer session")?;

    info!(
        entities = summary.entities,
        links = summary.links,
        configuration = summary.configuration,
        assets = summary.assets,
        "Transfer complete"
    );
    Ok(())
}
