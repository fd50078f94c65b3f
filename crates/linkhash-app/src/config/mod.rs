//! Configuration loading and XDG path helpers.
//!
//! Sources, lowest precedence first: built-in defaults,
//! `$LINKHASH_ETC_CONFIG_DIR/linkhash/settings.toml` (default `/etc`),
//! `$XDG_CONFIG_HOME/linkhash/settings.toml`, `./config/settings.toml`, the
//! file named by `LINKHASH_CONFIG_FILE`, and `LINKHASH__SECTION__KEY`
//! environment variables.

use std::env;
use std::path::PathBuf;

use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;
use linkhash_server::ServerConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_ENQUEUE_TIMEOUT_MS, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_STORE_MAP_SIZE_BYTES, DEFAULT_WORKER_CONCURRENCY,
};

const APP_NAME: &str = "linkhash";
const SETTINGS_FILE: &str = "settings.toml";
const LOCAL_CONFIG_FILE: &str = "config/settings";
const ETC_DIR_ENV: &str = "LINKHASH_ETC_CONFIG_DIR";
const CONFIG_FILE_ENV: &str = "LINKHASH_CONFIG_FILE";
const ENV_PREFIX: &str = "LINKHASH";
const DEFAULT_ETC_DIR: &str = "/etc";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub workers: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub map_size_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub chunk_size: u64,
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
}

impl AppConfig {
    fn validate(self) -> Result<Self, AppConfigError> {
        if self.workers.concurrency == 0 {
            return Err(AppConfigError::Invalid(
                "workers.concurrency must be at least 1".to_string(),
            ));
        }
        if self.workers.chunk_size == 0 {
            return Err(AppConfigError::Invalid(
                "workers.chunk_size must be at least 1".to_string(),
            ));
        }
        if self.workers.queue_capacity == 0 {
            return Err(AppConfigError::Invalid(
                "workers.queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let default_storage = default_storage_path()?;
    let mut builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default(
            "storage.path",
            default_storage.to_string_lossy().to_string(),
        )?
        .set_default("storage.map_size_bytes", DEFAULT_STORE_MAP_SIZE_BYTES as u64)?
        .set_default("workers.concurrency", DEFAULT_WORKER_CONCURRENCY as u64)?
        .set_default("workers.chunk_size", DEFAULT_CHUNK_SIZE)?
        .set_default("workers.queue_capacity", DEFAULT_QUEUE_CAPACITY as u64)?
        .set_default("workers.enqueue_timeout_ms", DEFAULT_ENQUEUE_TIMEOUT_MS)?;

    builder = builder.add_source(
        File::from(etc_config_path())
            .format(FileFormat::Toml)
            .required(false),
    );
    if let Some(xdg_path) = xdg_config_path() {
        builder = builder.add_source(File::from(xdg_path).format(FileFormat::Toml).required(false));
    }
    builder = builder.add_source(File::with_name(LOCAL_CONFIG_FILE).required(false));
    if let Some(explicit) = env::var_os(CONFIG_FILE_ENV) {
        builder = builder.add_source(
            File::from(PathBuf::from(explicit))
                .format(FileFormat::Toml)
                .required(true),
        );
    }
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate()
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", APP_NAME, APP_NAME).ok_or(AppConfigError::MissingProjectDirs)
}

fn default_storage_path() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

fn etc_config_path() -> PathBuf {
    let root = env::var_os(ETC_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ETC_DIR));
    root.join(APP_NAME).join(SETTINGS_FILE)
}

fn xdg_config_path() -> Option<PathBuf> {
    project_dirs()
        .ok()
        .map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
}
