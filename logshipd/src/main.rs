//! # logshipd
//!
//! Restore full and log backups in a log-shipping scenario: seed a standby
//! database from a full backup, drain the segments already on disk, then
//! optionally keep watching the backup directory and apply new segments as
//! they arrive.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use logship_core::apply::SqlApplier;
use logship_core::{Orchestrator, RunOutcome};

use crate::config::Overrides;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "logshipd")]
#[command(about = "Continuously restore backup log segments onto a standby database")]
struct Cli {
    /// Configuration file
    #[arg(long)]
    conf: PathBuf,

    /// 'Later Than' cutoff override, RFC 3339 (segments at or before it
    /// are skipped)
    #[arg(long)]
    later_than: Option<String>,

    /// Restore the full backup before applying segments
    #[arg(long)]
    restore_full: bool,

    /// Sort and filter segments by their last-modified time instead of the
    /// timestamp in their names
    #[arg(long)]
    use_lastmod: bool,

    /// Keep monitoring the backup directory after catch-up drains
    #[arg(long)]
    monitor: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let overrides = Overrides {
        later_than: cli.later_than,
        restore_full: cli.restore_full,
        use_lastmod: cli.use_lastmod,
        monitor: cli.monitor,
    };
    let settings = config::load(&cli.conf, &overrides)?;

    // Lazy pool: the first connection is opened by the first statement, so
    // configuration problems surface before any network work.
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect_lazy(&settings.database_url)
        .context("invalid database connection string")?;

    let applier = Arc::new(SqlApplier::new(
        pool,
        settings.database,
        settings.full_statement,
        settings.log_statement,
    ));
    let orchestrator = Orchestrator::new(settings.run, applier);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    let worker = tokio::spawn(async move { orchestrator.run(&cancel).await });

    match worker.await.context("run task panicked")? {
        Ok(RunOutcome::Completed) => {
            info!("run complete");
            Ok(())
        }
        Ok(RunOutcome::Cancelled) => {
            info!("run interrupted, partial progress preserved");
            Ok(())
        }
        Err(err) => {
            error!(%err, "run failed");
            Err(err.into())
        }
    }
}
