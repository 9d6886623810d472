//! AFS server binary
//!
//! ## Usage
//!
//! ```bash
//! # Run the server (default)
//! afs-server --config /etc/afs/afs.toml
//! afs-server serve --bind 0.0.0.0:8085
//!
//! # List in-doubt transactions from the WAL without starting the server
//! afs-server recover
//!
//! # Print the shares found under the storage root
//! afs-server shares
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use afs_engine::transaction::TransactionRecord;
use afs_engine::{AfsConfig, WriteAheadLog, discover_shares};
use afs_server::constants::DEFAULT_CONFIG_PATH;
use afs_server::{ApiServer, serve};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Transactional file storage server.
#[derive(Parser, Debug)]
#[command(name = "afs-server")]
#[command(about = "Transactional file storage server (2PC participant)")]
struct Cli {
    /// Config file (default: ./afs.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Listen address, overrides [server].bind
    #[arg(long, global = true)]
    bind: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve requests (default)
    Serve,
    /// List transactions left undecided in the WAL
    Recover,
    /// List the shares under the storage root
    Shares,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => cmd_serve(config).await,
        Command::Recover => cmd_recover(&config).await,
        Command::Shares => cmd_shares(&config).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<AfsConfig> {
    let path = path.or_else(|| {
        let default = Path::new(DEFAULT_CONFIG_PATH);
        default.exists().then_some(default)
    });
    let config = match path {
        Some(path) => AfsConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let config = AfsConfig::default();
            config.validate().context("default configuration")?;
            config
        }
    };
    Ok(config)
}

async fn cmd_serve(config: AfsConfig) -> Result<()> {
    let api = Arc::new(
        ApiServer::open(&config)
            .await
            .context("starting transaction manager")?,
    );
    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    tracing::info!(
        bind = %config.server.bind,
        root = %config.storage.root.display(),
        wal = %config.transactions.wal_dir.display(),
        "afs server starting"
    );
    serve(api, listener, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    })
    .await?;
    Ok(())
}

/// Offline view of the WAL: nothing is decided or changed.
async fn cmd_recover(config: &AfsConfig) -> Result<()> {
    let wal = WriteAheadLog::open(
        &config.transactions.wal_dir,
        config.transactions.archive_finished,
    )
    .await?;
    let mut undecided = 0;
    for (id, lines) in wal.scan().await? {
        if lines.is_empty() {
            continue;
        }
        let record = TransactionRecord::replay(id, &lines)?;
        if record.state.is_terminal() {
            continue;
        }
        undecided += 1;
        let decision = record
            .decision
            .map(|d| format!(" decision={d:?}"))
            .unwrap_or_default();
        println!(
            "{id}  {}  operations={}{decision}",
            record.state,
            record.operations.len()
        );
    }
    if undecided == 0 {
        println!("no in-doubt transactions");
    }
    Ok(())
}

async fn cmd_shares(config: &AfsConfig) -> Result<()> {
    for share in discover_shares(&config.storage.root).await? {
        println!("{:>6}  {}", share.id, share.root.display());
    }
    Ok(())
}
