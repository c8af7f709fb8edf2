// pgstash/src/backup/retention.rs
use tokio_util::sync::CancellationToken;

use super::cancellable;
use crate::errors::{BackupError, Result};
use crate::storage::Storage;
use crate::storage::keys::sort_most_recent_first;

/// Result of a retention pass, both lists most recent first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub retained: Vec<String>,
    pub deleted: Vec<String>,
}

/// Splits most-recent-first keys into the `retention_count` kept and the surplus.
pub fn split_surplus(keys: &[String], retention_count: usize) -> (&[String], &[String]) {
    keys.split_at(retention_count.min(keys.len()))
}

/// Lists stored backups for this instance, most recent first.
pub async fn list_dumps(store: &dyn Storage) -> Result<Vec<String>> {
    let keys = store.list().await.map_err(BackupError::List)?;
    if keys.is_empty() {
        tracing::info!("No backups found");
        return Ok(Vec::new());
    }

    let keys = sort_most_recent_first(store.trim_prefix(&keys));
    tracing::debug!(keys = ?keys, "Found backups");
    Ok(keys)
}

/// Deletes every backup beyond the newest `retention_count`, oldest-relative
/// order after the retained prefix. Stops at the first failed delete; what was
/// already deleted stays deleted.
pub async fn purge_dumps(
    store: &dyn Storage,
    retention_count: usize,
    token: &CancellationToken,
) -> Result<PurgeOutcome> {
    let keys = list_dumps(store).await?;
    let (retained, surplus) = split_surplus(&keys, retention_count);

    if surplus.is_empty() {
        tracing::info!(retention = retention_count, "No backups to delete");
        return Ok(PurgeOutcome {
            retained: retained.to_vec(),
            deleted: Vec::new(),
        });
    }

    tracing::info!(count = surplus.len(), retention = retention_count, "Found backups to delete");
    let mut deleted = Vec::with_capacity(surplus.len());
    for key in surplus {
        if token.is_cancelled() {
            return Err(BackupError::RetentionCancelled(format!(
                "before deleting backup {} ({} deleted)",
                key,
                deleted.len()
            )));
        }
        tracing::info!(key = %key, "Deleting backup");
        let what = format!("while deleting backup {}", key);
        let deleted_one = cancellable(token, &what, store.delete(key))
            .await
            .map_err(BackupError::in_retention)?;
        if let Err(e) = deleted_one {
            tracing::error!(key = %key, error = %e, "Error deleting backup");
            return Err(BackupError::Delete {
                key: key.clone(),
                reason: e,
            });
        }
        deleted.push(key.clone());
    }

    tracing::info!("Deletion completed successfully");
    Ok(PurgeOutcome {
        retained: retained.to_vec(),
        deleted,
    })
}
