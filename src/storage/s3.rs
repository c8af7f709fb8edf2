// pgstash/src/storage/s3.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::Utc;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use std::sync::OnceLock;

use super::Storage;
use super::keys::{build_key, format_timestamp, trim_prefix};
use crate::config::SpacesConfig;

/// S3-compatible object storage (AWS S3, DigitalOcean Spaces, MinIO, ...).
///
/// Backups are written to `<folder_prefix>/<instance_id>/<timestamp>/<file>`.
#[derive(Debug)]
pub struct S3Storage {
    spaces_config: SpacesConfig,
    instance_id: String,
    client: OnceLock<s3::Client>,
}

impl S3Storage {
    pub fn new(spaces_config: SpacesConfig, instance_id: impl Into<String>) -> Self {
        Self {
            spaces_config,
            instance_id: instance_id.into(),
            client: OnceLock::new(),
        }
    }

    /// Prefix excluding the timestamp, shared by every backup of this instance.
    fn instance_prefix(&self) -> String {
        let folder = self.spaces_config.folder_prefix.as_deref().unwrap_or_default();
        format!("{}/", build_key([folder, self.instance_id.as_str()]))
    }

    fn client(&self) -> Result<&s3::Client> {
        self.client
            .get()
            .context("S3 storage used before init() established a session")
    }

    async fn list_prefix(&self, prefix: &str, delimiter: Option<&str>) -> Result<Vec<String>> {
        let client = self.client()?;
        let bucket = &self.spaces_config.bucket_name;
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let resp = client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_delimiter(delimiter.map(str::to_string))
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .with_context(|| format!("Failed to list s3://{}/{}", bucket, prefix))?;

            keys.extend(
                resp.common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix())
                    .map(str::to_string),
            );
            keys.extend(
                resp.contents()
                    .iter()
                    .filter_map(|o| o.key())
                    .map(str::to_string),
            );

            match resp.next_continuation_token() {
                Some(token) if resp.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn init(&self) -> Result<()> {
        if self.client.get().is_some() {
            return Ok(());
        }
        let spaces_config = &self.spaces_config;

        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static",
            ));
        if let Some(endpoint_url) = &spaces_config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        let sdk_config = loader.load().await;

        // Custom endpoints (Spaces, MinIO) rarely support virtual-hosted buckets.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(spaces_config.endpoint_url.is_some())
            .build();
        let client = s3::Client::from_conf(s3_config);

        if let Err(e) = client
            .head_bucket()
            .bucket(&spaces_config.bucket_name)
            .send()
            .await
        {
            tracing::warn!(
                bucket = %spaces_config.bucket_name,
                error = %e,
                "Could not verify target bucket with HEAD request; uploads may still succeed"
            );
        }

        let _ = self.client.set(client);
        tracing::debug!(storage = %self.name(), "S3 session established");
        Ok(())
    }

    async fn upload(&self, local_path: &Path) -> Result<String> {
        let client = self.client()?;
        let bucket = &self.spaces_config.bucket_name;
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Invalid upload file name: {}", local_path.display()))?;

        let timestamp = format_timestamp(Utc::now());
        let key = build_key([self.instance_prefix().as_str(), timestamp.as_str(), file_name]);

        tracing::debug!(file = %local_path.display(), bucket = %bucket, key = %key, "Uploading file to S3");
        let body = ByteStream::from_path(local_path)
            .await
            .with_context(|| format!("Failed to create ByteStream from file: {}", local_path.display()))?;

        client
            .put_object()
            .bucket(bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to upload file {} to S3 bucket {} with key {}",
                    local_path.display(),
                    bucket,
                    key
                )
            })?;

        Ok(key)
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.list_prefix(&self.instance_prefix(), Some("/")).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.trim_matches('/');
        if key.is_empty() {
            anyhow::bail!("Refusing to delete an empty backup key");
        }
        let client = self.client()?;
        let bucket = &self.spaces_config.bucket_name;
        let prefix = format!("{}{}/", self.instance_prefix(), key);

        let objects = self.list_prefix(&prefix, None).await?;
        if objects.is_empty() {
            tracing::warn!(prefix = %prefix, "No objects found for backup");
        }
        for object_key in objects {
            client
                .delete_object()
                .bucket(bucket)
                .key(&object_key)
                .send()
                .await
                .with_context(|| format!("Failed to delete s3://{}/{}", bucket, object_key))?;
            tracing::debug!(key = %object_key, "Deleted object");
        }
        Ok(())
    }

    fn trim_prefix(&self, keys: &[String]) -> Vec<String> {
        trim_prefix(keys, &self.instance_prefix())
    }

    fn name(&self) -> String {
        format!("s3 ({})", self.spaces_config.bucket_name)
    }
}
