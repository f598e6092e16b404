// Configuration module for the relay

use anyhow::Result;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

static CONFIG_PATH: OnceCell<PathBuf> = OnceCell::new();

const MIN_HEARTBEAT_INTERVAL_MS: u64 = 100;

/// Live config handle shared by the relay components.
pub type SharedConfig = Arc<RwLock<AppConfig>>;

/// Global streaming discipline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    /// Pass upstream chunks through as they arrive.
    #[default]
    Real,
    /// Accumulate upstream, then synthesize a stream for the client.
    Fake,
    /// Per request, chosen by the model identifier.
    Mix,
}

impl StreamingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Fake => "fake",
            Self::Mix => "mix",
        }
    }
}

impl std::str::FromStr for StreamingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "real" => Ok(Self::Real),
            "fake" => Ok(Self::Fake),
            "mix" => Ok(Self::Mix),
            other => Err(format!("unknown streaming mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Credential the automation layer presents on `/ws`. Generated per run
    /// when a launcher is configured and this is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_token: Option<String>,

    #[serde(default = "default_auth_dir")]
    pub auth_dir: String,

    #[serde(default)]
    pub initial_auth_index: Option<usize>,

    #[serde(default)]
    pub streaming_mode: StreamingMode,

    /// Consecutive failures before rotating; 0 disables.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Successful generative calls before rotating; 0 disables.
    #[serde(default)]
    pub switch_on_uses: u32,

    /// Total attempts per request, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_immediate_switch_status_codes")]
    pub immediate_switch_status_codes: Vec<u16>,

    #[serde(default = "default_first_message_timeout_ms")]
    pub first_message_timeout_ms: u64,

    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default)]
    pub launcher: Option<LauncherConfig>,
}

/// External automation process spawned once per active account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LauncherConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: Vec::new(),
            channel_token: None,
            auth_dir: default_auth_dir(),
            initial_auth_index: None,
            streaming_mode: StreamingMode::default(),
            failure_threshold: default_failure_threshold(),
            switch_on_uses: 0,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            immediate_switch_status_codes: default_immediate_switch_status_codes(),
            first_message_timeout_ms: default_first_message_timeout_ms(),
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            launcher: None,
        }
    }
}

impl AppConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn first_message_timeout(&self) -> Duration {
        Duration::from_millis(self.first_message_timeout_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }

    /// Never shorter than `MIN_HEARTBEAT_INTERVAL_MS`; a zero period would stall the ticker.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(MIN_HEARTBEAT_INTERVAL_MS))
    }

    pub fn is_immediate_switch_status(&self, status: u16) -> bool {
        self.immediate_switch_status_codes.contains(&status)
    }

    /// Apply `RELAY_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("RELAY_STREAMING_MODE") {
            match mode.parse() {
                Ok(mode) => self.streaming_mode = mode,
                Err(e) => tracing::warn!("Ignoring RELAY_STREAMING_MODE: {}", e),
            }
        }
        if let Ok(port) = std::env::var("RELAY_PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(e) => tracing::warn!("Ignoring RELAY_PORT '{}': {}", port, e),
            }
        }
        if let Ok(keys) = std::env::var("RELAY_API_KEYS") {
            self.api_keys = keys
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        }
        if let Ok(token) = std::env::var("RELAY_CHANNEL_TOKEN") {
            if !token.trim().is_empty() {
                self.channel_token = Some(token.trim().to_string());
            }
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7860
}

fn default_auth_dir() -> String {
    "~/.gemini-relay/auth".to_string()
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_immediate_switch_status_codes() -> Vec<u16> {
    vec![429, 503]
}

fn default_first_message_timeout_ms() -> u64 {
    300_000
}

fn default_stream_idle_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    3000
}

fn default_ready_timeout_ms() -> u64 {
    60_000
}

/// Resolve the config file location from `GEMINI_RELAY_CONFIG` or the working directory.
pub fn default_config_path() -> PathBuf {
    std::env::var("GEMINI_RELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yaml"))
}

/// Read the config file, writing defaults if it does not exist yet.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content)?
    } else {
        let default_config = AppConfig::default();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(&default_config)?)?;
        default_config
    };
    config.apply_env_overrides();
    Ok(config)
}

pub fn init_config(path: &Path) -> Result<SharedConfig> {
    let config = load_config(path)?;
    CONFIG_PATH.set(path.to_path_buf()).ok();

    tracing::info!("Config initialized from {:?}", path);
    Ok(Arc::new(RwLock::new(config)))
}

/// Replace the live config and write it back to the file it was loaded from.
pub fn update_config(shared: &SharedConfig, config: AppConfig) -> Result<()> {
    *shared.write() = config.clone();

    if let Some(path) = CONFIG_PATH.get() {
        let content = serde_yaml::to_string(&config)?;
        std::fs::write(path, content)?;
    }

    Ok(())
}

pub fn resolve_auth_dir(auth_dir: &str) -> PathBuf {
    if let Some(rest) = auth_dir.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }

    PathBuf::from(auth_dir)
}
