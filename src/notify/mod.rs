// pgstash/src/notify/mod.rs
pub mod discord;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::config::AppConfig;
use crate::errors::BackupError;

pub use discord::DiscordNotifier;

/// Name notifications are sent under.
pub const PROGRAM_IDENTIFIER: &str = "pgstash";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("notifiers are disabled")]
pub struct NotifiersDisabled;

/// A channel backup events are reported to.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn enabled(&self) -> bool;

    async fn notify_backup_success(&self, databases: usize, key: &str) -> Result<()>;

    async fn notify_backup_failure(&self, err: &BackupError) -> Result<()>;

    async fn notify_backup_delete_failure(&self, err: &BackupError) -> Result<()>;
}

/// Fans events out to every enabled notifier.
///
/// Individual send failures are logged, never returned; a failed webhook must
/// not fail the backup it reports on.
pub struct NotifierSet {
    enabled: bool,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            notifiers: Vec::new(),
        }
    }

    /// All notifiers configured in `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut set = Self::new(config.notifiers.enabled);
        if let Some(discord) = &config.notifiers.discord {
            set.register(Arc::new(DiscordNotifier::new(discord, &config.instance_id)?));
        }
        Ok(set)
    }

    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    fn active(&self, event: &str) -> std::result::Result<Vec<&Arc<dyn Notifier>>, NotifiersDisabled> {
        if !self.enabled {
            return Err(NotifiersDisabled);
        }
        Ok(self
            .notifiers
            .iter()
            .filter(|n| {
                let enabled = n.enabled();
                if !enabled {
                    tracing::debug!(event, "Notifier disabled; skipping");
                }
                enabled
            })
            .collect())
    }

    pub async fn notify_backup_success(
        &self,
        databases: usize,
        key: &str,
    ) -> std::result::Result<(), NotifiersDisabled> {
        for notifier in self.active("backup success")? {
            if let Err(e) = notifier.notify_backup_success(databases, key).await {
                tracing::error!(error = %format!("{:#}", e), "Failed to send backup success notification");
            }
        }
        Ok(())
    }

    pub async fn notify_backup_failure(&self, err: &BackupError) -> std::result::Result<(), NotifiersDisabled> {
        for notifier in self.active("backup failure")? {
            if let Err(e) = notifier.notify_backup_failure(err).await {
                tracing::error!(error = %format!("{:#}", e), "Failed to send backup failure notification");
            }
        }
        Ok(())
    }

    pub async fn notify_backup_delete_failure(
        &self,
        err: &BackupError,
    ) -> std::result::Result<(), NotifiersDisabled> {
        for notifier in self.active("backup delete failure")? {
            if let Err(e) = notifier.notify_backup_delete_failure(err).await {
                tracing::error!(
                    error = %format!("{:#}", e),
                    "Failed to send backup deletion failure notification"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeNotifier, Sent};

    #[tokio::test]
    async fn test_disabled_set_reports_disabled() {
        let notifier = Arc::new(FakeNotifier::enabled());
        let mut set = NotifierSet::new(false);
        set.register(notifier.clone());

        assert_eq!(set.notify_backup_success(1, "key").await, Err(NotifiersDisabled));
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_fans_out_to_enabled_notifiers_only() {
        let on = Arc::new(FakeNotifier::enabled());
        let off = Arc::new(FakeNotifier::disabled());
        let mut set = NotifierSet::new(true);
        set.register(on.clone());
        set.register(off.clone());

        set.notify_backup_success(3, "pg/prod/20240101000000/a.tar.gz")
            .await
            .unwrap();

        assert_eq!(
            on.sent(),
            vec![Sent::Success {
                databases: 3,
                key: "pg/prod/20240101000000/a.tar.gz".to_string()
            }]
        );
        assert!(off.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_does_not_stop_fan_out() {
        let broken = Arc::new(FakeNotifier::enabled().failing());
        let healthy = Arc::new(FakeNotifier::enabled());
        let mut set = NotifierSet::new(true);
        set.register(broken.clone());
        set.register(healthy.clone());
        let err = BackupError::ZeroExport { total: 2 };

        assert!(set.notify_backup_failure(&err).await.is_ok());

        assert_eq!(broken.sent().len(), 1);
        assert_eq!(
            healthy.sent(),
            vec![Sent::Failure("No databases were exported (2 found)".to_string())]
        );
    }

    #[tokio::test]
    async fn test_delete_failure_event() {
        let notifier = Arc::new(FakeNotifier::enabled());
        let mut set = NotifierSet::new(true);
        set.register(notifier.clone());
        let err = BackupError::Delete {
            key: "20240101000000".to_string(),
            reason: anyhow::anyhow!("access denied"),
        };

        set.notify_backup_delete_failure(&err).await.unwrap();

        assert!(matches!(&notifier.sent()[0], Sent::DeleteFailure(msg) if msg.contains("20240101000000")));
    }
}
