// pgstash/src/storage/mod.rs
pub mod keys;
pub mod s3;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

pub use s3::S3Storage;

/// Remote destination for backup archives.
///
/// Keys returned by [`Storage::upload`] embed the upload time so that, after
/// [`Storage::trim_prefix`], they can be ordered with
/// [`keys::sort_most_recent_first`].
#[async_trait]
pub trait Storage: Send + Sync {
    /// Prepares the backend, e.g. establishes a client session.
    async fn init(&self) -> Result<()>;

    /// Uploads a local file and returns the remote key.
    async fn upload(&self, local_path: &Path) -> Result<String>;

    /// Returns every backup key stored for this instance.
    async fn list(&self) -> Result<Vec<String>>;

    /// Deletes one backup, addressed by its prefix-trimmed key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Strips the shared instance prefix from the given keys.
    fn trim_prefix(&self, keys: &[String]) -> Vec<String>;

    /// Human readable backend identity, used in logs.
    fn name(&self) -> String;
}
