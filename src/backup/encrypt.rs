// pgstash/src/backup/encrypt.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::exec::{CommandSpec, Executor, StderrMode};

/// Public-key encryption of the backup archive.
#[async_trait]
pub trait Encryptor: Send + Sync {
    /// Imports the public key `key_id` from `key_server`.
    async fn fetch_public_key(&self, key_id: &str, key_server: &str) -> Result<()>;

    /// Encrypts `path` for `recipient`, returning the encrypted file's path.
    /// The input file is left in place.
    async fn encrypt_file(&self, path: &Path, recipient: &str) -> Result<PathBuf>;
}

/// [`Encryptor`] driving the `gpg` command line tool.
pub struct GpgEncryptor {
    exec: Arc<dyn Executor>,
    home: Option<PathBuf>,
}

impl GpgEncryptor {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec, home: None }
    }

    /// Uses a dedicated keyring directory instead of the user's default.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    fn command(&self) -> CommandSpec {
        let mut cmd = CommandSpec::new("gpg")
            .arg("--batch")
            .with_stderr(StderrMode::Capture);
        if let Some(home) = &self.home {
            cmd = cmd.arg("--homedir").arg(home.display().to_string());
        }
        cmd
    }

    async fn run_checked(&self, cmd: CommandSpec, what: &str) -> Result<()> {
        let output = self.exec.run(&cmd).await.with_context(|| format!("Failed to {}", what))?;
        if !output.success() {
            anyhow::bail!(
                "gpg failed to {} ({}): {}",
                what,
                output.status_display(),
                output.combined().trim()
            );
        }
        Ok(())
    }
}

pub fn encrypted_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".gpg");
    PathBuf::from(name)
}

#[async_trait]
impl Encryptor for GpgEncryptor {
    async fn fetch_public_key(&self, key_id: &str, key_server: &str) -> Result<()> {
        let cmd = self
            .command()
            .arg("--keyserver")
            .arg(key_server)
            .arg("--recv-keys")
            .arg(key_id);
        self.run_checked(cmd, &format!("fetch key {} from {}", key_id, key_server))
            .await
    }

    async fn encrypt_file(&self, path: &Path, recipient: &str) -> Result<PathBuf> {
        let output_path = encrypted_path(path);
        let cmd = self
            .command()
            .arg("--yes")
            .arg("--trust-model")
            .arg("always")
            .arg("--recipient")
            .arg(recipient)
            .arg("--output")
            .arg(output_path.display().to_string())
            .arg("--encrypt")
            .arg(path.display().to_string());
        self.run_checked(cmd, &format!("encrypt {}", path.display()))
            .await?;
        Ok(output_path)
    }
}
