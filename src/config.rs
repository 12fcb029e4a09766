//! Configuration loading for deskflow.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::protocol::topics;

pub type Result<T> = std::result::Result<T, Error>;

/// Get the deskflow home directory (~/.deskflow).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".deskflow"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.deskflow/settings.json, then apply `.env` and
/// environment overrides.
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_settings_path()?)
}

/// Load settings from an explicit path. A missing file yields defaults.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let mut settings = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        tracing::debug!("Loaded settings from {}", path.display());
        settings
    } else {
        tracing::debug!("No settings at {}, using defaults", path.display());
        Settings::default()
    };

    // A missing .env is the normal case.
    let _ = dotenvy::dotenv();
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;

    validate_settings(&settings)?;
    Ok(settings)
}

fn apply_env_overrides<F>(settings: &mut Settings, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup("DESKFLOW_DB_PATH") {
        settings.database.path = Some(PathBuf::from(path));
    }
    if let Some(raw) = lookup("DESKFLOW_PUBLISH_TIMEOUT_MS") {
        settings.bus.publish_timeout_ms = raw.parse().map_err(|_| {
            Error::Config(format!("DESKFLOW_PUBLISH_TIMEOUT_MS is not a number: {}", raw))
        })?;
    }
    if let Some(queue) = lookup("DESKFLOW_WORKER_QUEUE") {
        settings.worker.queue = queue;
    }
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.bus.publish_timeout_ms == 0 {
        return Err(Error::Config("bus.publish_timeout_ms must be positive".to_string()));
    }
    if settings.bus.queue_capacity == 0 {
        return Err(Error::Config("bus.queue_capacity must be positive".to_string()));
    }
    if settings.outbox.batch_size == 0 {
        return Err(Error::Config("outbox.batch_size must be positive".to_string()));
    }
    if settings.worker.enabled {
        let bound = settings
            .bus
            .bindings
            .values()
            .any(|queues| queues.iter().any(|q| q == &settings.worker.queue));
        if !bound {
            return Err(Error::Config(format!(
                "worker.queue '{}' is not bound to any topic in bus.bindings",
                settings.worker.queue
            )));
        }
    }
    Ok(())
}

/// Database configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DatabaseSettings {
    /// SQLite file; defaults to ~/.deskflow/deskflow.db
    pub path: Option<PathBuf>,
}

impl DatabaseSettings {
    pub fn resolve_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("deskflow.db")),
        }
    }
}

/// Event bus configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BusSettings {
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Topic -> queues routing table.
    #[serde(default = "default_bindings")]
    pub bindings: HashMap<String, Vec<String>>,
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_bindings() -> HashMap<String, Vec<String>> {
    let mut bindings = HashMap::new();
    bindings.insert(
        topics::CONVERSATION_CREATED.to_string(),
        vec![topics::CONVERSATION_CREATED.to_string()],
    );
    bindings
}

impl BusSettings {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            publish_timeout_ms: default_publish_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            bindings: default_bindings(),
        }
    }
}

/// Assignment worker configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_enabled")]
    pub enabled: bool,
    #[serde(default = "default_worker_queue")]
    pub queue: String,
}

fn default_worker_enabled() -> bool {
    true
}

fn default_worker_queue() -> String {
    topics::CONVERSATION_CREATED.to_string()
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enabled: default_worker_enabled(),
            queue: default_worker_queue(),
        }
    }
}

/// Outbox relay configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OutboxSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    64
}

fn default_max_attempts() -> u32 {
    10
}

impl OutboxSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// deskflow settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub bus: BusSettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub outbox: OutboxSettings,
}
