// pgstash/src/testing.rs
//! In-memory stand-ins for the pipeline's external capabilities.
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backup::archive::Archiver;
use crate::backup::encrypt::{Encryptor, encrypted_path};
use crate::errors::BackupError;
use crate::exec::{CommandOutput, CommandSpec, Executor};
use crate::notify::Notifier;
use crate::storage::Storage;
use crate::storage::keys::trim_prefix;

fn exited(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

fn flag_value<'a>(cmd: &'a CommandSpec, flag: &str) -> Option<&'a str> {
    cmd.args.iter().find_map(|a| a.strip_prefix(flag))
}

/// Scripted `psql`, `pg_dump` and `gpg`. Every binary is on the fake `PATH`
/// unless removed with [`FakeExecutor::without_binary`].
#[derive(Default)]
pub struct FakeExecutor {
    missing: Vec<String>,
    databases: String,
    psql_failure: Option<String>,
    failing_dumps: Vec<String>,
    dump_spawn_error: bool,
    gpg_failure: Option<String>,
    cancel_after: Option<(usize, CancellationToken)>,
    looked_up: Mutex<Vec<String>>,
    calls: Mutex<Vec<CommandSpec>>,
    dumped: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_binary(mut self, binary: &str) -> Self {
        self.missing.push(binary.to_string());
        self
    }

    /// Raw `psql -At` output returned when listing databases.
    pub fn with_databases(mut self, output: &str) -> Self {
        self.databases = output.to_string();
        self
    }

    pub fn with_psql_failure(mut self, stderr: &str) -> Self {
        self.psql_failure = Some(stderr.to_string());
        self
    }

    pub fn with_failing_dump(mut self, database: &str) -> Self {
        self.failing_dumps.push(database.to_string());
        self
    }

    /// Every `pg_dump` invocation fails to start.
    pub fn with_dump_spawn_error(mut self) -> Self {
        self.dump_spawn_error = true;
        self
    }

    pub fn with_gpg_failure(mut self, stderr: &str) -> Self {
        self.gpg_failure = Some(stderr.to_string());
        self
    }

    /// Cancels `token` once `count` dumps have been attempted.
    pub fn cancel_after_dumps(mut self, count: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((count, token));
        self
    }

    pub fn looked_up(&self) -> Vec<String> {
        self.looked_up.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Databases `pg_dump` was invoked for, in order.
    pub fn dumped(&self) -> Vec<String> {
        self.dumped.lock().unwrap().clone()
    }

    fn run_pg_dump(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let database = flag_value(cmd, "--dbname=")
            .ok_or_else(|| anyhow!("pg_dump called without --dbname"))?
            .to_string();
        let attempted = {
            let mut dumped = self.dumped.lock().unwrap();
            dumped.push(database.clone());
            dumped.len()
        };
        if let Some((count, token)) = &self.cancel_after {
            if attempted >= *count {
                token.cancel();
            }
        }

        if self.dump_spawn_error {
            return Err(anyhow!("Failed to execute pg_dump: No such file or directory"));
        }
        if self.failing_dumps.contains(&database) {
            return Ok(exited(1, "", &format!("pg_dump: error: database \"{}\" is broken", database)));
        }

        let file = flag_value(cmd, "--file=").ok_or_else(|| anyhow!("pg_dump called without --file"))?;
        fs::write(file, format!("-- dump of {}\n", database))?;
        Ok(exited(0, "", ""))
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn look_path(&self, binary: &str) -> Result<PathBuf> {
        self.looked_up.lock().unwrap().push(binary.to_string());
        if self.missing.iter().any(|m| m == binary) {
            return Err(anyhow!("cannot resolve {}", binary));
        }
        Ok(PathBuf::from("/usr/bin").join(binary))
    }

    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(cmd.clone());
        match cmd.program.as_str() {
            "psql" => Ok(match &self.psql_failure {
                Some(stderr) => exited(2, "", stderr),
                None => exited(0, &self.databases, ""),
            }),
            "pg_dump" => self.run_pg_dump(cmd),
            "gpg" => Ok(match &self.gpg_failure {
                Some(stderr) => exited(2, "", stderr),
                None => exited(0, "", ""),
            }),
            other => Err(anyhow!("Failed to execute {}: not scripted", other)),
        }
    }
}

/// Prefix every key of the fake store lives under.
pub const FAKE_PREFIX: &str = "pg/test/";
/// Timestamp assigned to every upload.
pub const FAKE_UPLOAD_TIMESTAMP: &str = "20240110000000";

/// Object store holding one directory-like key per backup.
#[derive(Default)]
pub struct FakeStorage {
    keys: Mutex<Vec<String>>,
    list_failure: Option<String>,
    upload_failure: Option<String>,
    delete_failure: Option<String>,
    cancel_on_list: Option<CancellationToken>,
    uploads: Mutex<Vec<PathBuf>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing backups, given as timestamps, stored in the given order.
    pub fn with_backups(timestamps: &[&str]) -> Self {
        let keys = timestamps
            .iter()
            .map(|ts| format!("{}{}/", FAKE_PREFIX, ts))
            .collect();
        Self {
            keys: Mutex::new(keys),
            ..Self::default()
        }
    }

    pub fn failing_list(mut self, reason: &str) -> Self {
        self.list_failure = Some(reason.to_string());
        self
    }

    pub fn failing_upload(mut self, reason: &str) -> Self {
        self.upload_failure = Some(reason.to_string());
        self
    }

    pub fn failing_delete(mut self, key: &str) -> Self {
        self.delete_failure = Some(key.to_string());
        self
    }

    /// Cancels `token` whenever the backups are listed.
    pub fn cancel_on_list(mut self, token: CancellationToken) -> Self {
        self.cancel_on_list = Some(token);
        self
    }

    pub fn uploads(&self) -> Vec<PathBuf> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// Prefix-trimmed keys still stored, in storage order.
    pub fn remaining(&self) -> Vec<String> {
        trim_prefix(&self.keys.lock().unwrap(), FAKE_PREFIX)
    }
}

#[async_trait]
impl Storage for FakeStorage {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn upload(&self, local_path: &Path) -> Result<String> {
        if let Some(reason) = &self.upload_failure {
            return Err(anyhow!("{}", reason));
        }
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("Invalid upload file name: {}", local_path.display()))?;
        self.uploads.lock().unwrap().push(local_path.to_path_buf());
        self.keys
            .lock()
            .unwrap()
            .push(format!("{}{}/", FAKE_PREFIX, FAKE_UPLOAD_TIMESTAMP));
        Ok(format!("{}{}/{}", FAKE_PREFIX, FAKE_UPLOAD_TIMESTAMP, file_name))
    }

    async fn list(&self) -> Result<Vec<String>> {
        if let Some(token) = &self.cancel_on_list {
            token.cancel();
        }
        if let Some(reason) = &self.list_failure {
            return Err(anyhow!("{}", reason));
        }
        Ok(self.keys.lock().unwrap().clone())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.delete_failure.as_deref() == Some(key) {
            return Err(anyhow!("access denied"));
        }
        let full = format!("{}{}/", FAKE_PREFIX, key);
        self.keys.lock().unwrap().retain(|k| *k != full);
        self.deleted.lock().unwrap().push(key.to_string());
        Ok(())
    }

    fn trim_prefix(&self, keys: &[String]) -> Vec<String> {
        trim_prefix(keys, FAKE_PREFIX)
    }

    fn name(&self) -> String {
        "fake (test)".to_string()
    }
}

/// Writes a placeholder file instead of a real archive.
#[derive(Default)]
pub struct FakeArchiver {
    fail: bool,
    calls: Mutex<Vec<(PathBuf, PathBuf)>>,
}

impl FakeArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(PathBuf, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Archiver for FakeArchiver {
    fn archive(&self, source_dir: &Path, archive_path: &Path) -> Result<PathBuf> {
        self.calls
            .lock()
            .unwrap()
            .push((source_dir.to_path_buf(), archive_path.to_path_buf()));
        if self.fail {
            return Err(anyhow!("disk full"));
        }
        fs::write(archive_path, b"archive")?;
        Ok(archive_path.to_path_buf())
    }
}

#[derive(Default)]
pub struct FakeEncryptor {
    fail_fetch: bool,
    fail_encrypt: bool,
    fetched: Mutex<Vec<(String, String)>>,
}

impl FakeEncryptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_fetch() -> Self {
        Self {
            fail_fetch: true,
            ..Self::default()
        }
    }

    pub fn failing_encrypt() -> Self {
        Self {
            fail_encrypt: true,
            ..Self::default()
        }
    }

    /// `(key_id, key_server)` pairs requested so far.
    pub fn fetched(&self) -> Vec<(String, String)> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Encryptor for FakeEncryptor {
    async fn fetch_public_key(&self, key_id: &str, key_server: &str) -> Result<()> {
        self.fetched
            .lock()
            .unwrap()
            .push((key_id.to_string(), key_server.to_string()));
        if self.fail_fetch {
            return Err(anyhow!("keyserver receive failed: No data"));
        }
        Ok(())
    }

    async fn encrypt_file(&self, path: &Path, _recipient: &str) -> Result<PathBuf> {
        if self.fail_encrypt {
            return Err(anyhow!("encryption failed: Unusable public key"));
        }
        let output = encrypted_path(path);
        fs::write(&output, b"encrypted")?;
        Ok(output)
    }
}

/// Notification events as recorded by [`FakeNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Success { databases: usize, key: String },
    Failure(String),
    DeleteFailure(String),
}

#[derive(Default)]
pub struct FakeNotifier {
    enabled: bool,
    fail: bool,
    sent: Mutex<Vec<Sent>>,
}

impl FakeNotifier {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, event: Sent) -> Result<()> {
        self.sent.lock().unwrap().push(event);
        if self.fail {
            return Err(anyhow!("webhook returned 500"));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn notify_backup_success(&self, databases: usize, key: &str) -> Result<()> {
        self.record(Sent::Success {
            databases,
            key: key.to_string(),
        })
    }

    async fn notify_backup_failure(&self, err: &BackupError) -> Result<()> {
        self.record(Sent::Failure(err.to_string()))
    }

    async fn notify_backup_delete_failure(&self, err: &BackupError) -> Result<()> {
        self.record(Sent::DeleteFailure(err.to_string()))
    }
}
