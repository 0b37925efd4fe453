use std::path::PathBuf;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;

use crate::services::orchestrator::OrchestratorSettings;
use crate::services::poller::PollOptions;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// Backend base URL (e.g., "http://localhost:8000")
    #[serde(default = "default_api_url")]
    #[garde(length(min = 1))]
    pub api_url: String,

    /// JSON file holding the token pair between runs
    #[serde(default = "default_session_file")]
    #[garde(skip)]
    pub session_file: PathBuf,

    /// Credentials used when no stored session can be restored
    #[serde(default)]
    #[garde(skip)]
    pub email: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub password: Option<String>,

    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    #[garde(skip)]
    pub log_json: bool,

    #[serde(default = "default_poll_interval_ms")]
    #[garde(range(min = 1))]
    pub poll_interval_ms: u64,

    #[serde(default = "default_poll_timeout_ms")]
    #[garde(range(min = 1))]
    pub poll_timeout_ms: u64,

    /// Consecutive failed status reads before polling gives up
    #[serde(default = "default_poll_max_retries")]
    #[garde(range(min = 1))]
    pub poll_max_retries: u32,

    /// Pause between triggering a retry and the first status read
    #[serde(default = "default_retry_settle_ms")]
    #[garde(skip)]
    pub retry_settle_ms: u64,

    /// How long before expiry the access token is refreshed
    #[serde(default = "default_refresh_buffer_secs")]
    #[garde(skip)]
    pub refresh_buffer_secs: u64,

    /// Page size used when loading a project's market studies
    #[serde(default = "default_page_size")]
    #[garde(range(min = 1, max = 100))]
    pub page_size: u32,
}

fn default_api_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_session_file() -> PathBuf {
    PathBuf::from(".aso-session.json")
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_poll_timeout_ms() -> u64 {
    30 * 60 * 1_000
}

fn default_poll_max_retries() -> u32 {
    10
}

fn default_retry_settle_ms() -> u64 {
    1_000
}

fn default_refresh_buffer_secs() -> u64 {
    120
}

fn default_page_size() -> u32 {
    100
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_millis(self.poll_timeout_ms),
            max_retries: self.poll_max_retries,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            poll: self.poll_options(),
            retry_settle: Duration::from_millis(self.retry_settle_ms),
            page_size: self.page_size,
        }
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}
