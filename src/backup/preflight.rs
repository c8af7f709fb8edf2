// pgstash/src/backup/preflight.rs
use anyhow::Context;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::errors::{BackupError, Result};
use crate::exec::Executor;

const EXPORT_DIR: &str = "export";
#[cfg(unix)]
const LOCATION_MODE: u32 = 0o750;

/// Ephemeral working directory owned by a single run.
///
/// Layout: `<root>/export/<database>.sql` for dumps, archives directly in `<root>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupLocation {
    root: PathBuf,
}

impl BackupLocation {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn export_dir(&self) -> PathBuf {
        self.root.join(EXPORT_DIR)
    }

    pub fn archive_path(&self, timestamp: &str) -> PathBuf {
        self.root.join(format!("database_backup_{}.tar.gz", timestamp))
    }

    /// Removes anything left by a previous run and recreates the layout.
    pub fn reset(&self) -> anyhow::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove old backup location {}", self.root.display())
                });
            }
        }

        for dir in [self.root.clone(), self.export_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create backup directory {}", dir.display()))?;
            restrict_permissions(&dir)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(dir: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(LOCATION_MODE))
        .with_context(|| format!("Failed to set permissions on {}", dir.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_dir: &Path) -> anyhow::Result<()> {
    Ok(())
}

/// Prepares the backup location and checks that every required binary is on `PATH`.
pub fn run_preflight(
    location: &BackupLocation,
    required_binaries: &[&str],
    exec: &dyn Executor,
) -> Result<()> {
    location.reset().map_err(BackupError::Preflight)?;

    for bin in required_binaries {
        let path = exec
            .look_path(bin)
            .with_context(|| format!("{} not found in PATH", bin))
            .map_err(BackupError::Preflight)?;
        tracing::debug!(binary = %bin, path = %path.display(), "Found required binary");
    }
    Ok(())
}
