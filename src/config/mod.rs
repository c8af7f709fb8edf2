// pgstash/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_RETENTION_COUNT: usize = 30;
pub const DEFAULT_PG_PORT: u16 = 5432;
const DEFAULT_BACKUP_DIR_NAME: &str = "pgstash";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonPostgresConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonBackupOptions {
    pub retention_count: Option<usize>,
    #[serde(default)]
    pub encrypt: bool,
    pub backup_location: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub excluded_databases: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonGpgConfig {
    pub key_id: Option<String>,
    pub key_server: Option<String>,
    pub home: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonEncryptionConfig {
    pub gpg: Option<JsonGpgConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonDiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonNotifiersConfig {
    #[serde(default)]
    pub enabled: bool,
    pub discord: Option<JsonDiscordConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub instance_id: Option<String>,
    pub source_database_url: Option<String>,
    pub postgres: Option<JsonPostgresConfig>,
    pub backup: Option<JsonBackupOptions>,
    pub encryption: Option<JsonEncryptionConfig>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub notifiers: Option<JsonNotifiersConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl PostgresConfig {
    /// Connection settings handed to `psql`/`pg_dump` through libpq variables.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("PGUSER".to_string(), self.user.clone()),
            ("PGPASSWORD".to_string(), self.password.clone()),
            ("PGHOST".to_string(), self.host.clone()),
            ("PGPORT".to_string(), self.port.to_string()),
        ]
    }

    fn from_url(raw_url: &str) -> Result<Self> {
        let parsed = Url::parse(raw_url)
            .with_context(|| format!("Invalid database URL format: {}", raw_url))?;
        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            anyhow::bail!("Database URL must use the postgres:// scheme");
        }
        Ok(PostgresConfig {
            host: parsed.host_str().unwrap_or("localhost").to_string(),
            port: parsed.port().unwrap_or(DEFAULT_PG_PORT),
            user: parsed.username().to_string(),
            password: parsed.password().unwrap_or_default().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpgConfig {
    pub key_id: String,
    pub key_server: String,
    /// Keyring directory passed as `--homedir`; the user's default when unset.
    pub home: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub retention_count: usize,
    pub encrypt: bool,
    pub backup_location: PathBuf,
    pub timeout: Option<Duration>,
    pub excluded_databases: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: Option<String>,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub enabled: bool,
    pub webhook: String,
}

#[derive(Debug, Clone, Default)]
pub struct NotifiersConfig {
    pub enabled: bool,
    pub discord: Option<DiscordConfig>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub instance_id: String,
    pub postgres: PostgresConfig,
    pub backup: BackupConfig,
    pub encryption: Option<GpgConfig>,
    pub spaces_config: SpacesConfig,
    pub notifiers: NotifiersConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        Self::from_raw(raw_json_config, |name| std::env::var(name).ok())
    }

    /// Validates the raw file contents, applying overrides from `env`.
    pub fn from_raw(raw: RawJsonConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        let instance_id = raw
            .instance_id
            .filter(|s| !s.trim().is_empty())
            .context("instance_id must be set in config.json")?;
        if instance_id.contains('/') {
            anyhow::bail!("instance_id must not contain '/': {}", instance_id);
        }

        let postgres = load_postgres_config(raw.source_database_url, raw.postgres, &env)?;
        let backup = load_backup_config(raw.backup.unwrap_or_default())?;

        let encryption = if backup.encrypt {
            let gpg = raw
                .encryption
                .and_then(|e| e.gpg)
                .context("backup.encrypt is enabled but encryption.gpg is missing in config.json")?;
            Some(GpgConfig {
                key_id: gpg
                    .key_id
                    .filter(|s| !s.is_empty())
                    .context("encryption.gpg.key_id must be set when encryption is enabled")?,
                key_server: gpg
                    .key_server
                    .filter(|s| !s.is_empty())
                    .context("encryption.gpg.key_server must be set when encryption is enabled")?,
                home: gpg.home.filter(|p| !p.as_os_str().is_empty()),
            })
        } else {
            None
        };

        let spaces_config = load_spaces_config(raw.s3_storage.unwrap_or_default(), &env)?;
        let notifiers = load_notifiers_config(raw.notifiers.unwrap_or_default(), &env)?;

        Ok(AppConfig {
            instance_id,
            postgres,
            backup,
            encryption,
            spaces_config,
            notifiers,
        })
    }
}

fn load_postgres_config(
    source_database_url: Option<String>,
    json: Option<JsonPostgresConfig>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<PostgresConfig> {
    let mut postgres = match (json, source_database_url.or_else(|| env("SOURCE_DATABASE_URL"))) {
        (Some(pg), _) => PostgresConfig {
            host: pg.host.unwrap_or_else(|| "localhost".to_string()),
            port: pg.port.unwrap_or(DEFAULT_PG_PORT),
            user: pg.user.context("postgres.user must be set in config.json")?,
            password: pg.password.unwrap_or_default(),
        },
        (None, Some(url)) => PostgresConfig::from_url(&url)?,
        (None, None) => anyhow::bail!(
            "Either postgres or source_database_url must be set in config.json (or SOURCE_DATABASE_URL in the environment)"
        ),
    };
    if let Some(password) = env("PGPASSWORD") {
        postgres.password = password;
    }
    if postgres.user.is_empty() {
        anyhow::bail!("Postgres user cannot be empty");
    }
    Ok(postgres)
}

fn load_backup_config(json: JsonBackupOptions) -> Result<BackupConfig> {
    let retention_count = json.retention_count.unwrap_or(DEFAULT_RETENTION_COUNT);
    if retention_count == 0 {
        return Err(anyhow::anyhow!(
            "backup.retention_count must be at least 1; 0 would delete the backup just created"
        ));
    }
    let backup_location = json
        .backup_location
        .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_BACKUP_DIR_NAME));
    if backup_location.as_os_str().is_empty() || backup_location.parent().is_none() {
        return Err(anyhow::anyhow!(
            "backup.backup_location must be a dedicated directory, got {:?}",
            backup_location
        ));
    }

    Ok(BackupConfig {
        retention_count,
        encrypt: json.encrypt,
        backup_location,
        timeout: json.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs),
        excluded_databases: json
            .excluded_databases
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    })
}

fn load_spaces_config(
    s3_raw: JsonS3StorageConfig,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<SpacesConfig> {
    let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());

    Ok(SpacesConfig {
        bucket_name: non_empty(s3_raw.bucket_name)
            .context("s3_storage.bucket_name must be set in config.json")?,
        region: non_empty(s3_raw.region).context("s3_storage.region must be set in config.json")?,
        access_key_id: env("S3_ACCESS_KEY_ID")
            .or(non_empty(s3_raw.access_key_id))
            .context("s3_storage.access_key_id must be set in config.json or S3_ACCESS_KEY_ID")?,
        secret_access_key: env("S3_SECRET_ACCESS_KEY")
            .or(non_empty(s3_raw.secret_access_key))
            .context(
                "s3_storage.secret_access_key must be set in config.json or S3_SECRET_ACCESS_KEY",
            )?,
        endpoint_url: non_empty(s3_raw.endpoint_url),
        folder_prefix: non_empty(s3_raw.folder_prefix),
    })
}

fn load_notifiers_config(
    json: JsonNotifiersConfig,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<NotifiersConfig> {
    let discord = match json.discord {
        Some(discord) if discord.enabled => {
            let webhook = env("DISCORD_WEBHOOK_URL")
                .or(discord.webhook.filter(|s| !s.is_empty()))
                .context("notifiers.discord.webhook must be set when the Discord notifier is enabled")?;
            Url::parse(&webhook).context("notifiers.discord.webhook is not a valid URL")?;
            Some(DiscordConfig {
                enabled: true,
                webhook,
            })
        }
        _ => None,
    };

    Ok(NotifiersConfig {
        enabled: json.enabled,
        discord,
    })
}
