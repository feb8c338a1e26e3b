//! Configuration management for Tether
//!
//! Handles loading, saving, and managing orchestrator configuration:
//! session limits, execution loop timing and the default provider.

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default values shared by the config structs and their serde defaults
pub mod defaults {
    /// Maximum concurrent sessions held by one manager
    pub const MAX_SESSIONS: usize = 10;
    /// Queued prompts per session before `send_input` fails
    pub const INPUT_QUEUE_CAPACITY: usize = 32;
    /// Chunks a watcher may fall behind before it lags
    pub const BROADCAST_CAPACITY: usize = 256;
    /// Interval at which the execution loop flushes coalesced text
    pub const HEARTBEAT_INTERVAL_MS: u64 = 250;
    /// Maximum number of agentic iterations per user message
    pub const MAX_ITERATIONS: usize = 100;
    /// Silence after which a watcher evaluates its observations
    pub const WATCHER_SILENCE_TIMEOUT_SECS: u64 = 5;
    /// Provider used when none is requested
    pub const DEFAULT_PROVIDER: &str = "echo";
}

/// Main orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Session registry settings
    #[serde(default)]
    pub sessions: SessionSettings,
    /// Execution loop settings
    #[serde(default)]
    pub execution: ExecutionSettings,
    /// Provider selection
    #[serde(default)]
    pub provider: ProviderSettings,
}

/// Session registry and buffering settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub max_sessions: usize,
    pub input_queue_capacity: usize,
    pub broadcast_capacity: usize,
    /// Buffer a `UserInput` chunk for every prompt so replay shows the full transcript
    pub echo_user_input: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_sessions: defaults::MAX_SESSIONS,
            input_queue_capacity: defaults::INPUT_QUEUE_CAPACITY,
            broadcast_capacity: defaults::BROADCAST_CAPACITY,
            echo_user_input: true,
        }
    }
}

/// Execution loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub heartbeat_interval_ms: u64,
    pub max_iterations: usize,
    pub watcher_silence_timeout_secs: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: defaults::HEARTBEAT_INTERVAL_MS,
            max_iterations: defaults::MAX_ITERATIONS,
            watcher_silence_timeout_secs: defaults::WATCHER_SILENCE_TIMEOUT_SECS,
        }
    }
}

impl ExecutionSettings {
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn watcher_silence_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.watcher_silence_timeout_secs)
    }
}

/// Provider selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub default_provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            default_provider: defaults::DEFAULT_PROVIDER.to_string(),
            default_model: None,
        }
    }
}

impl Config {
    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sessions.max_sessions == 0 {
            return Err(Error::Config("sessions.max_sessions must be at least 1".to_string()));
        }
        if self.sessions.input_queue_capacity == 0 {
            return Err(Error::Config(
                "sessions.input_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.sessions.broadcast_capacity == 0 {
            return Err(Error::Config(
                "sessions.broadcast_capacity must be at least 1".to_string(),
            ));
        }
        if self.execution.max_iterations == 0 {
            return Err(Error::Config("execution.max_iterations must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Loads and saves the configuration file
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a config manager with a specific path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            Config::default()
        };
        config.validate()?;

        Ok(Self { config_path, config })
    }

    /// Get the default config path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("tether").join("config.toml"))
    }

    fn load_from_path(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Path the configuration is loaded from and saved to
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable access to configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Set the default provider
    pub fn set_default_provider(&mut self, name: &str) {
        self.config.provider.default_provider = name.to_string();
    }
}
