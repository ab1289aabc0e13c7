use super::ConfigError;
use crate::shared::{LogLevel, TenantId};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_WORKER_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_SCHEDULER_POLL_MS: u64 = 60_000;
pub const DEFAULT_IPC_POLL_MS: u64 = 1_000;
pub const DEFAULT_INBOX_POLL_MS: u64 = 1_000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub state_root: PathBuf,
    #[serde(default)]
    pub project_root: Option<PathBuf>,
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub main_tenant: MainTenantConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default = "default_scheduler_poll")]
    pub scheduler: PollConfig,
    #[serde(default = "default_ipc_poll")]
    pub ipc: PollConfig,
    #[serde(default = "default_inbox_poll")]
    pub inbox: PollConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MainTenantConfig {
    pub id: String,
    #[serde(default = "default_main_name")]
    pub name: String,
    pub chat: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_binary")]
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_worker_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub verbose_audit: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary: default_worker_binary(),
            args: Vec::new(),
            timeout_seconds: default_worker_timeout_seconds(),
            max_output_bytes: default_max_output_bytes(),
            verbose_audit: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PollConfig {
    pub poll_interval_ms: u64,
}

impl PollConfig {
    pub fn every_ms(poll_interval_ms: u64) -> Self {
        Self { poll_interval_ms }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
}

fn default_assistant_name() -> String {
    "Andy".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_main_name() -> String {
    "Main".to_string()
}

fn default_worker_binary() -> String {
    "clawkeeper-agent".to_string()
}

fn default_worker_timeout_seconds() -> u64 {
    DEFAULT_WORKER_TIMEOUT_SECONDS
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_scheduler_poll() -> PollConfig {
    PollConfig::every_ms(DEFAULT_SCHEDULER_POLL_MS)
}

fn default_ipc_poll() -> PollConfig {
    PollConfig::every_ms(DEFAULT_IPC_POLL_MS)
}

fn default_inbox_poll() -> PollConfig {
    PollConfig::every_ms(DEFAULT_INBOX_POLL_MS)
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.state_root.is_absolute() {
            return Err(ConfigError::Settings(
                "`state_root` must be an absolute path".to_string(),
            ));
        }
        if let Some(project_root) = &self.project_root {
            if !project_root.is_absolute() {
                return Err(ConfigError::Settings(
                    "`project_root` must be an absolute path".to_string(),
                ));
            }
        }
        if self.assistant_name.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`assistant_name` must be non-empty".to_string(),
            ));
        }
        self.resolve_timezone()?;

        TenantId::parse(&self.main_tenant.id).map_err(ConfigError::Settings)?;
        if self.main_tenant.chat.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`main_tenant.chat` must be non-empty".to_string(),
            ));
        }

        if self.worker.binary.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`worker.binary` must be non-empty".to_string(),
            ));
        }
        if self.worker.timeout_seconds == 0 {
            return Err(ConfigError::Settings(
                "`worker.timeout_seconds` must be > 0".to_string(),
            ));
        }
        if self.worker.max_output_bytes == 0 {
            return Err(ConfigError::Settings(
                "`worker.max_output_bytes` must be > 0".to_string(),
            ));
        }

        for (name, interval) in [
            ("scheduler", self.scheduler.poll_interval_ms),
            ("ipc", self.ipc.poll_interval_ms),
            ("inbox", self.inbox.poll_interval_ms),
        ] {
            if interval == 0 {
                return Err(ConfigError::Settings(format!(
                    "`{name}.poll_interval_ms` must be > 0"
                )));
            }
        }

        Ok(())
    }

    pub fn resolve_timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone.parse::<Tz>().map_err(|_| {
            ConfigError::Settings(format!(
                "invalid timezone `{}`; expected IANA timezone id",
                self.timezone
            ))
        })
    }

    pub fn main_tenant_id(&self) -> Result<TenantId, ConfigError> {
        TenantId::parse(&self.main_tenant.id).map_err(ConfigError::Settings)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.timeout_seconds)
    }

    pub fn trigger_prefix(&self) -> String {
        format!("@{}", self.assistant_name.trim())
    }
}
