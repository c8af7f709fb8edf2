//! PostgreSQL backup tool
//!
//! Dumps every database on a server, archives and optionally encrypts the
//! dumps, uploads them to S3-compatible storage and enforces retention.

// pgstash/src/main.rs
mod backup;
mod config;
mod errors;
mod exec;
mod notify;
mod storage;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use backup::{BackupOrchestrator, DumpResult, PipelineSettings};
use clap::{Parser, Subcommand};
use config::AppConfig;
use exec::SystemExecutor;
use notify::{NotifierSet, NotifiersDisabled};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use storage::{S3Storage, Storage};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, short = 'c', env = "PGSTASH_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Log level; overrides RUST_LOG.
    #[arg(long)]
    verbose: Option<LevelFilter>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Back up all databases, purge old backups and send notifications (default).
    Backup,
    /// Back up all databases and purge old backups, without notifications.
    Dump,
    /// List stored backups, most recent first.
    List,
    /// Delete backups beyond the retention count.
    Purge,
}

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run_app(cli).await {
        Ok(()) => {
            tracing::info!("Operation completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Operation failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: Option<LevelFilter>) {
    let filter = match verbose {
        Some(level) => EnvFilter::default().add_directive(level.into()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Cancels the returned token on Ctrl-C and, if set, once `timeout` elapses.
fn shutdown_token(timeout: Option<std::time::Duration>) -> CancellationToken {
    let token = CancellationToken::new();

    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    if let Some(timeout) = timeout {
        let on_timeout = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    tracing::warn!(timeout_secs = timeout.as_secs(), "Run timeout reached, cancelling");
                    on_timeout.cancel();
                }
                _ = on_timeout.cancelled() => {}
            }
        });
    }

    token
}

async fn run_app(cli: Cli) -> Result<()> {
    let app_config = AppConfig::load_from_json(&cli.config).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            cli.config.display()
        )
    })?;

    let store = Arc::new(S3Storage::new(
        app_config.spaces_config.clone(),
        &app_config.instance_id,
    ));
    store.init().await.context("Failed to initialise storage")?;

    let orchestrator = BackupOrchestrator::new(
        PipelineSettings::from_config(&app_config),
        store,
        Arc::new(SystemExecutor),
    );
    let token = shutdown_token(app_config.backup.timeout);

    match cli.command.unwrap_or(Command::Backup) {
        Command::Backup => {
            tracing::info!(instance = %app_config.instance_id, "Starting backup");
            let notifiers = NotifierSet::from_config(&app_config)
                .context("Failed to initialise notifiers")?;
            let result = backup_with_notifications(&orchestrator, &notifiers, &token)
                .await
                .inspect_err(log_pipeline_failure)?;
            log_dump_result(&result);
        }
        Command::Dump => {
            tracing::info!(instance = %app_config.instance_id, "Starting dump");
            let result = orchestrator.dump(&token).await.inspect_err(log_pipeline_failure)?;
            log_dump_result(&result);
        }
        Command::List => {
            for key in orchestrator.list_dumps().await? {
                println!("{}", key);
            }
        }
        Command::Purge => {
            let outcome = orchestrator.purge_dumps(&token).await?;
            tracing::info!(
                retained = outcome.retained.len(),
                deleted = outcome.deleted.len(),
                "Retention enforced"
            );
        }
    }
    Ok(())
}

fn log_dump_result(result: &DumpResult) {
    tracing::info!(
        exported = result.exported_databases,
        total = result.total_databases,
        key = %result.storage_key,
        "Backup created"
    );
}

/// What a failed run left behind.
fn failure_summary(err: &errors::BackupError) -> &'static str {
    match (err.backup_created(), err.is_cancelled()) {
        (true, true) => "Backup created, retention interrupted by cancellation",
        (true, false) => "Backup created, retention incomplete",
        (false, true) => "Run cancelled, no backup created",
        (false, false) => "No backup created",
    }
}

fn log_pipeline_failure(err: &errors::BackupError) {
    tracing::error!(stage = ?err.stage(), "{}", failure_summary(err));
}

fn report_notification(sent: std::result::Result<(), NotifiersDisabled>) {
    if let Err(e) = sent {
        tracing::debug!(reason = %e, "Notification not sent");
    }
}

/// Creates a backup, then enforces retention, reporting each outcome to
/// `notifiers`. Notification problems never change the result.
async fn backup_with_notifications(
    orchestrator: &BackupOrchestrator,
    notifiers: &NotifierSet,
    token: &CancellationToken,
) -> errors::Result<DumpResult> {
    let result = match orchestrator.create_dump(token).await {
        Ok(result) => result,
        Err(e) => {
            report_notification(notifiers.notify_backup_failure(&e).await);
            return Err(e);
        }
    };
    report_notification(
        notifiers
            .notify_backup_success(result.exported_databases, &result.storage_key)
            .await,
    );

    if let Err(e) = orchestrator
        .purge_dumps(token)
        .await
        .map_err(errors::BackupError::in_retention)
    {
        report_notification(notifiers.notify_backup_delete_failure(&e).await);
        return Err(e);
    }
    Ok(result)
}
