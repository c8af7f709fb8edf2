// pgstash/src/notify/discord.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

use super::{Notifier, PROGRAM_IDENTIFIER};
use crate::config::DiscordConfig;
use crate::errors::BackupError;

const SUCCESS_COLOR: u32 = 1498748;
const FAILURE_COLOR: u32 = 14554702;
const DELETION_FAILURE_COLOR: u32 = 14590998;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts webhook messages to a Discord channel.
pub struct DiscordNotifier {
    enabled: bool,
    webhook: String,
    instance_id: String,
    client: reqwest::Client,
}

impl DiscordNotifier {
    pub fn new(config: &DiscordConfig, instance_id: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .context("Failed to build HTTP client for Discord")?;
        Ok(Self {
            enabled: config.enabled,
            webhook: config.webhook.clone(),
            instance_id: instance_id.to_string(),
            client,
        })
    }

    async fn send(&self, message: &Value) -> Result<()> {
        self.client
            .post(&self.webhook)
            .json(message)
            .send()
            .await
            .context("Failed to reach Discord webhook")?
            .error_for_status()
            .context("Discord webhook rejected the message")?;
        Ok(())
    }
}

fn message(content: String, embed: Value) -> Value {
    json!({
        "username": PROGRAM_IDENTIFIER,
        "content": content,
        "embeds": [embed],
        "components": [],
    })
}

pub fn success_message(instance_id: &str, databases: usize, key: &str) -> Value {
    message(
        format!("**PG-DB Backup Successful** - *{}*", instance_id),
        json!({
            "color": SUCCESS_COLOR,
            "fields": [
                { "name": "Key", "value": key, "inline": false },
                { "name": "Databases", "value": databases.to_string(), "inline": false },
            ],
        }),
    )
}

fn error_message(headline: &str, instance_id: &str, color: u32, err: &BackupError) -> Value {
    message(
        format!("**{}** - *{}*", headline, instance_id),
        json!({
            "title": "Error",
            "description": err.to_string(),
            "color": color,
        }),
    )
}

pub fn failure_message(instance_id: &str, err: &BackupError) -> Value {
    error_message("PG-DB Backup Failed", instance_id, FAILURE_COLOR, err)
}

pub fn delete_failure_message(instance_id: &str, err: &BackupError) -> Value {
    error_message(
        "PG-DB Backup Deletion Failed",
        instance_id,
        DELETION_FAILURE_COLOR,
        err,
    )
}

#[async_trait]
impl Notifier for DiscordNotifier {
    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn notify_backup_success(&self, databases: usize, key: &str) -> Result<()> {
        self.send(&success_message(&self.instance_id, databases, key)).await
    }

    async fn notify_backup_failure(&self, err: &BackupError) -> Result<()> {
        self.send(&failure_message(&self.instance_id, err)).await
    }

    async fn notify_backup_delete_failure(&self, err: &BackupError) -> Result<()> {
        self.send(&delete_failure_message(&self.instance_id, err)).await
    }
}
