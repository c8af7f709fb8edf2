use thiserror::Error;

/// Pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preflight,
    Export,
    Archive,
    Encryption,
    Upload,
    Retention,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Preflight check failed: {0:#}")]
    Preflight(anyhow::Error),

    #[error("Error getting list of databases: {0:#}")]
    Enumeration(anyhow::Error),

    #[error("Dump tool could not be invoked: {0:#}")]
    Export(anyhow::Error),

    #[error("No databases were exported ({total} found)")]
    ZeroExport { total: usize },

    #[error("Archive operation failed: {0:#}")]
    Archive(anyhow::Error),

    #[error("Encryption failed: {0:#}")]
    Encryption(anyhow::Error),

    #[error("Upload to {storage} failed: {reason:#}")]
    Upload { storage: String, reason: anyhow::Error },

    #[error("Error listing backups: {0:#}")]
    List(anyhow::Error),

    #[error("Error deleting backup {key}: {reason:#}")]
    Delete { key: String, reason: anyhow::Error },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Retention cancelled: {0}")]
    RetentionCancelled(String),
}

impl BackupError {
    pub fn stage(&self) -> Stage {
        match self {
            BackupError::Preflight(_) => Stage::Preflight,
            BackupError::Enumeration(_) | BackupError::Export(_) | BackupError::ZeroExport { .. } => {
                Stage::Export
            }
            BackupError::Archive(_) => Stage::Archive,
            BackupError::Encryption(_) => Stage::Encryption,
            BackupError::Upload { .. } => Stage::Upload,
            BackupError::List(_)
            | BackupError::Delete { .. }
            | BackupError::RetentionCancelled(_) => Stage::Retention,
            BackupError::Cancelled(_) => Stage::Cancelled,
        }
    }

    /// True when the error was raised after a backup had already been uploaded,
    /// i.e. only retention enforcement failed.
    pub fn backup_created(&self) -> bool {
        self.stage() == Stage::Retention
    }

    /// Reclassifies a cancellation raised while enforcing retention.
    pub fn in_retention(self) -> Self {
        match self {
            BackupError::Cancelled(what) => BackupError::RetentionCancelled(what),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            BackupError::Cancelled(_) | BackupError::RetentionCancelled(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
