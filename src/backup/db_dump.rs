// pgstash/src/backup/db_dump.rs
use anyhow::anyhow;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use super::cancellable;
use crate::errors::{BackupError, Result};
use crate::exec::{CommandSpec, Executor, StderrMode};

/// Databases that exist on most servers but never hold application data.
pub const SYSTEM_DATABASES: &[&str] = &["postgres", "defaultdb"];

/// Connection settings and working directory shared by `psql` and `pg_dump`.
#[derive(Debug, Clone, Copy)]
pub struct PgContext<'a> {
    pub env: &'a [(String, String)],
    pub dir: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportFailure {
    pub database: String,
    pub reason: String,
}

/// Outcome of the export stage. `exported_databases <= total_databases`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportResult {
    pub total_databases: usize,
    pub exported_databases: usize,
    pub location: PathBuf,
    pub failures: Vec<ExportFailure>,
}

/// Running tally of the per-database loop.
#[derive(Debug, Default)]
struct ExportTally {
    total: usize,
    exported: usize,
    failures: Vec<ExportFailure>,
}

impl ExportTally {
    fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    fn succeeded(&mut self) {
        self.exported += 1;
    }

    fn failed(&mut self, database: &str, reason: String) {
        self.failures.push(ExportFailure {
            database: database.to_string(),
            reason,
        });
    }

    fn finish(self, location: &Path) -> ExportResult {
        ExportResult {
            total_databases: self.total,
            exported_databases: self.exported,
            location: location.to_path_buf(),
            failures: self.failures,
        }
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Query listing every non-template database outside the exclusion list.
pub fn build_list_query(extra_excluded: &[String]) -> String {
    let excluded: Vec<String> = SYSTEM_DATABASES
        .iter()
        .copied()
        .chain(extra_excluded.iter().map(String::as_str))
        .map(quote_literal)
        .collect();
    format!(
        "SELECT datname FROM pg_database WHERE datistemplate = false AND datname NOT IN ({});",
        excluded.join(",")
    )
}

/// Parses `psql -At` output: one name per line, trimmed, blanks dropped,
/// duplicates removed keeping the server's order.
pub fn parse_database_list(output: &str) -> Vec<String> {
    let mut databases: Vec<String> = Vec::new();
    for line in output.lines() {
        let name = line.trim();
        if name.is_empty() || databases.iter().any(|d| d == name) {
            continue;
        }
        databases.push(name.to_string());
    }
    databases
}

/// File name used for a database's dump, `None` if the name cannot be used
/// as a single path component.
pub fn dump_file_name(database: &str) -> Option<String> {
    let unsafe_name = database.is_empty()
        || database == "."
        || database == ".."
        || database.contains(['/', '\\', '\0']);
    (!unsafe_name).then(|| format!("{}.sql", database))
}

pub async fn enumerate_databases(
    exec: &dyn Executor,
    pg: PgContext<'_>,
    excluded: &[String],
    token: &CancellationToken,
) -> Result<Vec<String>> {
    let cmd = CommandSpec::new("psql")
        .arg("-At")
        .arg("-c")
        .arg(build_list_query(excluded))
        .with_env(pg.env)
        .with_dir(pg.dir)
        .with_stderr(StderrMode::Inherit);

    let output = cancellable(token, "while listing databases", exec.run(&cmd))
        .await?
        .map_err(BackupError::Enumeration)?;
    if !output.success() {
        return Err(BackupError::Enumeration(anyhow!(
            "psql failed with {}: {}",
            output.status_display(),
            output.combined().trim()
        )));
    }

    let databases = parse_database_list(&String::from_utf8_lossy(&output.stdout));
    tracing::debug!(databases = ?databases, location = %pg.dir.display(), "Databases to be dumped");
    Ok(databases)
}

/// Dumps each database into `export_dir`, one at a time.
///
/// A failing dump is logged and counted, never fatal. Only cancellation and
/// failing to start `pg_dump` at all abort the loop.
pub async fn export_databases(
    exec: &dyn Executor,
    pg: PgContext<'_>,
    export_dir: &Path,
    databases: &[String],
    token: &CancellationToken,
) -> Result<ExportResult> {
    let mut tally = ExportTally::new(databases.len());

    for db in databases {
        if token.is_cancelled() {
            return Err(BackupError::Cancelled(format!(
                "before exporting database {}",
                db
            )));
        }
        tracing::info!(database = %db, "Processing database");

        let Some(file_name) = dump_file_name(db) else {
            tracing::warn!(database = %db, "Skipping database with a name unusable as a file name");
            tally.failed(db, "database name cannot be used as a file name".to_string());
            continue;
        };
        let out_file = export_dir.join(file_name);

        let cmd = CommandSpec::new("pg_dump")
            .arg("--no-owner")
            .arg("--no-acl")
            .arg(format!("--dbname={}", db))
            .arg(format!("--file={}", out_file.display()))
            .with_env(pg.env)
            .with_dir(pg.dir)
            .with_stderr(StderrMode::Capture);

        let what = format!("while exporting database {}", db);
        let output = cancellable(token, &what, exec.run(&cmd))
            .await?
            .map_err(BackupError::Export)?;

        if output.success() {
            tally.succeeded();
            tracing::info!(database = %db, "Successfully dumped database");
        } else {
            let reason = format!("pg_dump failed with {}", output.status_display());
            tracing::warn!(
                database = %db,
                error = %reason,
                output = %output.combined().trim(),
                "Error dumping database"
            );
            tally.failed(db, reason);
        }
    }

    Ok(tally.finish(export_dir))
}
