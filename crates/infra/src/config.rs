//! Configuration loading and representation.
//!
//! Priority chain, highest first:
//! 1. `MAILOPS_*` environment variables, nested keys split on `__`
//!    (e.g. `MAILOPS_BOUNCE__PARALLEL__WORKERS=4`)
//! 2. the TOML file (default `mailops.toml`; a missing file is not an error)
//! 3. serde defaults below

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format as _, Toml},
};
use serde::Deserialize;
use url::Url;

use mailops_observability::LogFormat;

pub const DEFAULT_CONFIG_FILE: &str = "mailops.toml";
pub const ENV_PREFIX: &str = "MAILOPS_";

#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(#[source] Box<figment::Error>);

/// Load the configuration from `config_path` plus environment overrides.
pub fn load(config_path: &Path) -> Result<AppConfig, ConfigError> {
    Figment::new()
        .merge(Toml::file(config_path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|err| ConfigError(Box::new(err)))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub bounce: BounceConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Connection to the host application's database.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL; without it the jobs cannot reach their stores.
    pub url: Option<String>,
    /// Prefix of the host application's table names (default: `mw_`)
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    /// Connection acquisition timeout in seconds (default: 10)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            table_prefix: default_table_prefix(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_table_prefix() -> String {
    "mw_".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Directory holding the job lock files (default: `<tmp>/mailops-locks`)
    #[serde(default = "default_lock_dir")]
    pub dir: PathBuf,
    /// Seconds to wait for a busy lock before giving up (default: 5)
    #[serde(default = "default_lock_wait_secs")]
    pub wait_secs: u64,
}

impl LockConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            dir: default_lock_dir(),
            wait_secs: default_lock_wait_secs(),
        }
    }
}

fn default_lock_dir() -> PathBuf {
    std::env::temp_dir().join("mailops-locks")
}

fn default_lock_wait_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
    /// Base URL of the release API; required by `auto-update`.
    pub api_base: Option<Url>,
    /// Platform identifier reported with the version query
    /// (default: `<os>-<arch>` of this build)
    #[serde(default = "default_platform")]
    pub platform: String,
    /// Scratch directory for downloaded archives (default: `runtime/auto-update`)
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Root of the live installation the release is copied over (default: `.`)
    #[serde(default = "default_install_root")]
    pub install_root: PathBuf,
    /// License/purchase identifier sent with the artifact download.
    #[serde(default)]
    pub license_key: String,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub app: AppEntryConfig,
    #[serde(default)]
    pub drain: DrainConfig,
    /// Optional pre-update backup command.
    pub backup: Option<BackupConfig>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            platform: default_platform(),
            storage_dir: default_storage_dir(),
            install_root: default_install_root(),
            license_key: String::new(),
            tools: ToolsConfig::default(),
            app: AppEntryConfig::default(),
            drain: DrainConfig::default(),
            backup: None,
        }
    }
}

fn default_platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("runtime/auto-update")
}

fn default_install_root() -> PathBuf {
    PathBuf::from(".")
}

/// External tools the update pipeline shells out to.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_download_tool")]
    pub download: String,
    #[serde(default = "default_extract_tool")]
    pub extract: String,
    #[serde(default = "default_copy_tool")]
    pub copy: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            download: default_download_tool(),
            extract: default_extract_tool(),
            copy: default_copy_tool(),
        }
    }
}

fn default_download_tool() -> String {
    "curl".to_string()
}

fn default_extract_tool() -> String {
    "unzip".to_string()
}

fn default_copy_tool() -> String {
    "cp".to_string()
}

/// The host application's own command-line entry point.
#[derive(Debug, Clone, Deserialize)]
pub struct AppEntryConfig {
    #[serde(default = "default_app_program")]
    pub program: String,
    #[serde(default = "default_app_args")]
    pub args: Vec<String>,
}

impl Default for AppEntryConfig {
    fn default() -> Self {
        Self {
            program: default_app_program(),
            args: default_app_args(),
        }
    }
}

fn default_app_program() -> String {
    "php".to_string()
}

fn default_app_args() -> Vec<String> {
    vec!["apps/console/console.php".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct DrainConfig {
    /// Seconds between two polls of the processing count (default: 30)
    #[serde(default = "default_drain_interval_secs")]
    pub interval_secs: u64,
    /// Give up after waiting this many seconds (default: 43200, 12 hours)
    #[serde(default = "default_drain_ceiling_secs")]
    pub ceiling_secs: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_drain_interval_secs(),
            ceiling_secs: default_drain_ceiling_secs(),
        }
    }
}

fn default_drain_interval_secs() -> u64 {
    30
}

fn default_drain_ceiling_secs() -> u64 {
    12 * 3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BounceConfig {
    /// Tolerate overlapping runs (skip the job lock) (default: true)
    #[serde(default = "default_true")]
    pub fast: bool,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub parallel: ParallelConfig,
}

impl Default for BounceConfig {
    fn default() -> Self {
        Self {
            fast: true,
            ingest: IngestConfig::default(),
            parallel: ParallelConfig::default(),
        }
    }
}

/// Command that ingests one endpoint's mailbox.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            program: default_ingest_program(),
            args: Vec::new(),
        }
    }
}

fn default_ingest_program() -> String {
    "mailops-bounce-ingest".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParallelConfig {
    /// Use worker processes when the host supports them (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Endpoints processed concurrently per chunk (default: 10)
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Milliseconds between two reaping sweeps (default: 1000)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ParallelConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_workers() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(&dir.path().join("absent.toml")).unwrap();

        assert_eq!(cfg.lock.wait(), Duration::from_secs(5));
        assert_eq!(cfg.update.drain.interval_secs, 30);
        assert_eq!(cfg.update.drain.ceiling_secs, 43_200);
        assert_eq!(cfg.update.tools.download, "curl");
        assert!(cfg.bounce.fast);
        assert_eq!(cfg.bounce.parallel.workers, 10);
        assert_eq!(cfg.database.table_prefix, "mw_");
    }

    #[test]
    fn toml_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailops.toml");
        std::fs::write(
            &path,
            r#"
                [logging]
                format = "compact"

                [update]
                api_base = "https://releases.example.com/api/"
                license_key = "abc-123"
                storage_dir = "/var/lib/mailops/updates"

                [update.drain]
                interval_secs = 10

                [update.backup]
                program = "/usr/local/bin/snapshot"
                args = ["--all"]

                [bounce]
                fast = false

                [bounce.parallel]
                enabled = false
                workers = 3
            "#,
        )
        .unwrap();

        let cfg = load(&path).unwrap();
        assert_eq!(cfg.logging.format, LogFormat::Compact);
        assert_eq!(
            cfg.update.api_base.as_ref().map(Url::as_str),
            Some("https://releases.example.com/api/")
        );
        assert_eq!(cfg.update.license_key, "abc-123");
        assert_eq!(cfg.update.drain.interval_secs, 10);
        assert_eq!(cfg.update.drain.ceiling_secs, 43_200);
        let backup = cfg.update.backup.unwrap();
        assert!(backup.enabled);
        assert_eq!(backup.args, vec!["--all".to_string()]);
        assert!(!cfg.bounce.fast);
        assert!(!cfg.bounce.parallel.enabled);
        assert_eq!(cfg.bounce.parallel.workers, 3);
    }

    #[test]
    fn malformed_values_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailops.toml");
        std::fs::write(&path, "[bounce.parallel]\nworkers = \"many\"\n").unwrap();

        assert!(load(&path).is_err());
    }
}
