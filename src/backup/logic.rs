// pgstash/src/backup/logic.rs
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::archive::{Archiver, TarGzArchiver};
use super::cancellable;
use super::db_dump::{ExportResult, PgContext, enumerate_databases, export_databases};
use super::encrypt::{Encryptor, GpgEncryptor};
use super::preflight::{BackupLocation, run_preflight};
use super::retention::{self, PurgeOutcome};
use crate::config::{AppConfig, GpgConfig};
use crate::errors::{BackupError, Result};
use crate::exec::Executor;
use crate::storage::Storage;
use crate::storage::keys::format_timestamp;

/// Details of one completed export-archive-upload cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpResult {
    pub total_databases: usize,
    pub exported_databases: usize,
    pub dump_location: PathBuf,
    /// Plaintext archive, even when an encrypted copy was uploaded.
    pub archive_location: PathBuf,
    pub storage_key: String,
}

/// The parts of [`AppConfig`] the pipeline needs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub backup_location: PathBuf,
    pub pg_env: Vec<(String, String)>,
    pub retention_count: usize,
    pub excluded_databases: Vec<String>,
    pub encryption: Option<GpgConfig>,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            backup_location: config.backup.backup_location.clone(),
            pg_env: config.postgres.env_vars(),
            retention_count: config.backup.retention_count,
            excluded_databases: config.backup.excluded_databases.clone(),
            encryption: config.encryption.clone(),
        }
    }
}

/// Runs the backup pipeline and retention against one server and one storage
/// destination. Runs must not overlap: the backup location is reset on every
/// [`create_dump`](Self::create_dump).
pub struct BackupOrchestrator {
    settings: PipelineSettings,
    location: BackupLocation,
    store: Arc<dyn Storage>,
    exec: Arc<dyn Executor>,
    archiver: Arc<dyn Archiver>,
    encryptor: Option<Arc<dyn Encryptor>>,
}

impl BackupOrchestrator {
    pub fn new(settings: PipelineSettings, store: Arc<dyn Storage>, exec: Arc<dyn Executor>) -> Self {
        let location = BackupLocation::new(&settings.backup_location);
        let encryptor = settings.encryption.as_ref().map(|gpg_config| {
            let mut gpg = GpgEncryptor::new(Arc::clone(&exec));
            if let Some(home) = &gpg_config.home {
                gpg = gpg.with_home(home);
            }
            Arc::new(gpg) as Arc<dyn Encryptor>
        });
        Self {
            settings,
            location,
            store,
            exec,
            archiver: Arc::new(TarGzArchiver),
            encryptor,
        }
    }

    #[cfg(test)]
    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = archiver;
        self
    }

    #[cfg(test)]
    pub fn with_encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    #[cfg(test)]
    pub fn location(&self) -> &BackupLocation {
        &self.location
    }

    fn required_binaries(&self) -> Vec<&'static str> {
        let mut binaries = vec!["psql", "pg_dump"];
        if self.settings.encryption.is_some() {
            binaries.push("gpg");
        }
        binaries
    }

    fn pg_context(&self) -> PgContext<'_> {
        PgContext {
            env: &self.settings.pg_env,
            dir: self.location.root(),
        }
    }

    async fn export(&self, token: &CancellationToken) -> Result<ExportResult> {
        let databases = enumerate_databases(
            self.exec.as_ref(),
            self.pg_context(),
            &self.settings.excluded_databases,
            token,
        )
        .await?;
        tracing::info!(count = databases.len(), "Databases found");

        export_databases(
            self.exec.as_ref(),
            self.pg_context(),
            &self.location.export_dir(),
            &databases,
            token,
        )
        .await
    }

    async fn encrypt(&self, archive_path: PathBuf, token: &CancellationToken) -> Result<PathBuf> {
        let Some(gpg) = &self.settings.encryption else {
            return Ok(archive_path);
        };
        let encryptor = self.encryptor.as_ref().ok_or_else(|| {
            BackupError::Encryption(anyhow::anyhow!(
                "encryption is enabled but no encryptor is available"
            ))
        })?;

        tracing::debug!(key_id = %gpg.key_id, key_server = %gpg.key_server, "Fetching gpg key");
        cancellable(
            token,
            "while fetching gpg key",
            encryptor.fetch_public_key(&gpg.key_id, &gpg.key_server),
        )
        .await?
        .map_err(|e| {
            tracing::warn!(error = %e, "Error downloading gpg key");
            BackupError::Encryption(e)
        })?;

        tracing::debug!(file = %archive_path.display(), "Encrypting archive file");
        let encrypted = cancellable(
            token,
            "while encrypting archive",
            encryptor.encrypt_file(&archive_path, &gpg.key_id),
        )
        .await?
        .map_err(|e| {
            tracing::warn!(error = %e, "Error encrypting archive file");
            BackupError::Encryption(e)
        })?;
        tracing::debug!(file = %encrypted.display(), "Encrypted file");
        Ok(encrypted)
    }

    fn check_cancelled(token: &CancellationToken, stage: &str) -> Result<()> {
        if token.is_cancelled() {
            return Err(BackupError::Cancelled(format!("before {}", stage)));
        }
        Ok(())
    }

    /// Preflight, export, archive, optional encryption and upload.
    ///
    /// Nothing is rolled back on failure; leftovers in the backup location are
    /// removed by the next run's preflight.
    pub async fn create_dump(&self, token: &CancellationToken) -> Result<DumpResult> {
        Self::check_cancelled(token, "preflight")?;
        run_preflight(&self.location, &self.required_binaries(), self.exec.as_ref())?;

        let export = self.export(token).await?;
        for failure in &export.failures {
            tracing::warn!(database = %failure.database, reason = %failure.reason, "Database not exported");
        }
        if export.exported_databases == 0 {
            return Err(BackupError::ZeroExport {
                total: export.total_databases,
            });
        }
        tracing::info!(
            exported = export.exported_databases,
            total = export.total_databases,
            "Export finished"
        );

        Self::check_cancelled(token, "archiving")?;
        let archiver = Arc::clone(&self.archiver);
        let source_dir = export.location.clone();
        let archive_dest = self.location.archive_path(&format_timestamp(Utc::now()));
        let archive_path = tokio::task::spawn_blocking(move || archiver.archive(&source_dir, &archive_dest))
            .await
            .map_err(|e| BackupError::Archive(anyhow::Error::new(e)))?
            .map_err(BackupError::Archive)?;

        Self::check_cancelled(token, "encryption")?;
        let upload_path = self.encrypt(archive_path.clone(), token).await?;

        Self::check_cancelled(token, "upload")?;
        tracing::info!(file = %upload_path.display(), storage = %self.store.name(), "Uploading backup");
        let storage_key = cancellable(token, "during upload", self.store.upload(&upload_path))
            .await?
            .map_err(|reason| BackupError::Upload {
                storage: self.store.name(),
                reason,
            })?;
        tracing::info!(location = %storage_key, "Backup uploaded");

        Ok(DumpResult {
            total_databases: export.total_databases,
            exported_databases: export.exported_databases,
            dump_location: export.location,
            archive_location: archive_path,
            storage_key,
        })
    }

    /// Stored backups for this instance, most recent first.
    pub async fn list_dumps(&self) -> Result<Vec<String>> {
        retention::list_dumps(self.store.as_ref()).await
    }

    /// Deletes backups beyond the configured retention count.
    pub async fn purge_dumps(&self, token: &CancellationToken) -> Result<PurgeOutcome> {
        retention::purge_dumps(self.store.as_ref(), self.settings.retention_count, token).await
    }

    /// [`create_dump`](Self::create_dump) followed by [`purge_dumps`](Self::purge_dumps).
    ///
    /// A purge failure is returned even though the new backup is already in
    /// storage; check [`BackupError::backup_created`].
    pub async fn dump(&self, token: &CancellationToken) -> Result<DumpResult> {
        let result = self.create_dump(token).await?;
        self.purge_dumps(token)
            .await
            .map_err(BackupError::in_retention)?;
        Ok(result)
    }
}
