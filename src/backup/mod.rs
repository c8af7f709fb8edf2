// pgstash/src/backup/mod.rs
pub mod archive;
pub mod db_dump;
pub mod encrypt;
mod logic;
pub mod preflight;
pub mod retention;

use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::errors::{BackupError, Result};

pub use logic::{BackupOrchestrator, DumpResult, PipelineSettings};

/// Awaits `fut` unless `token` is cancelled first. The future is dropped on
/// cancellation, which kills any child process it owns.
pub(crate) async fn cancellable<T>(
    token: &CancellationToken,
    what: &str,
    fut: impl Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(BackupError::Cancelled(what.to_string())),
        out = fut => Ok(out),
    }
}
