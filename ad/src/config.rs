//! AgentDaemon configuration types and loading
//!
//! Configuration layers, lowest to highest precedence: built-in defaults, an
//! optional YAML file (project-local `.agentdaemon.yml`, then the user config
//! dir), then environment variables.

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::runtime::RuntimeConfig;
use crate::worker::WorkerConfig;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent identity and loop timing
    pub agent: AgentConfig,

    /// Filesystem layout
    pub paths: PathsConfig,

    /// Webhook listener settings
    pub webhook: WebhookConfig,

    /// Runtime tuning
    pub runtime: RuntimeTuning,

    /// Retention sweeps
    pub retention: RetentionConfig,
}

/// Agent identity and loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub personality: String,
    pub goal: String,
    /// Sleep between cycles, seconds
    #[serde(rename = "rest-time")]
    pub rest_time: f64,
    #[serde(rename = "heartbeat-interval")]
    pub heartbeat_interval: f64,
    #[serde(rename = "command-poll-interval")]
    pub command_poll_interval: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            personality: String::new(),
            goal: String::new(),
            rest_time: 5.0,
            heartbeat_interval: 10.0,
            command_poll_interval: 1.0,
        }
    }
}

/// Filesystem layout for the IPC plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    #[serde(rename = "state-root")]
    pub state_root: PathBuf,
    /// Defaults to `<state-root>/commands` when unset
    #[serde(rename = "command-root")]
    pub command_root: Option<PathBuf>,
    #[serde(rename = "cycle-db")]
    pub cycle_db_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from("./agent_state"),
            command_root: None,
            cycle_db_path: PathBuf::from("./agent_cycles.db"),
        }
    }
}

impl PathsConfig {
    /// The command queue root, derived from the state root when unset
    pub fn command_root(&self) -> PathBuf {
        self.command_root
            .clone()
            .unwrap_or_else(|| self.state_root.join("commands"))
    }
}

/// Webhook listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    #[serde(rename = "auth-token")]
    pub auth_token: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".to_string(),
            port: 8080,
            path: "/webhook".to_string(),
            auth_token: None,
        }
    }
}

/// Runtime tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeTuning {
    #[serde(rename = "graceful-shutdown-timeout")]
    pub graceful_shutdown_timeout: f64,
    #[serde(rename = "process-timeout")]
    pub process_timeout: f64,
    #[serde(rename = "scheduler-check-interval")]
    pub scheduler_check_interval: f64,
}

impl Default for RuntimeTuning {
    fn default() -> Self {
        Self {
            graceful_shutdown_timeout: 30.0,
            process_timeout: 300.0,
            scheduler_check_interval: 10.0,
        }
    }
}

/// Retention sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    #[serde(rename = "cycle-max-keep")]
    pub cycle_max_keep: usize,
    #[serde(rename = "command-max-age-hours")]
    pub command_max_age_hours: f64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            cycle_max_keep: 1000,
            command_max_age_hours: 24.0,
        }
    }
}

impl Config {
    /// Load configuration with the fallback chain, then apply environment
    /// overrides
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file(config_path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_file(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path)
                .context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".agentdaemon.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("agentdaemon").join("agentdaemon.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!(
                            "Failed to load config from {}: {}",
                            user_config.display(),
                            e
                        );
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Override settings from the recognized environment variables
    pub fn apply_env_overrides(&mut self) {
        fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|raw| raw.parse().ok())
        }

        if let Some(rest) = env_parse::<f64>("AGENT_REST_TIME") {
            self.agent.rest_time = rest;
        }
        if let Some(interval) = env_parse::<f64>("HEARTBEAT_INTERVAL_S") {
            self.agent.heartbeat_interval = interval;
        }
        if let Some(interval) = env_parse::<f64>("COMMAND_POLL_INTERVAL_S") {
            self.agent.command_poll_interval = interval;
        }

        if let Ok(root) = std::env::var("STATE_ROOT") {
            self.paths.state_root = PathBuf::from(root);
        }
        if let Ok(root) = std::env::var("COMMAND_ROOT") {
            self.paths.command_root = Some(PathBuf::from(root));
        }
        if let Ok(path) = std::env::var("CYCLE_DB_PATH") {
            self.paths.cycle_db_path = PathBuf::from(path);
        }
        if let Some(keep) = env_parse::<usize>("CYCLE_MAX_KEEP") {
            self.retention.cycle_max_keep = keep;
        }

        if let Some(enabled) = env_parse::<bool>("WEBHOOK_ENABLED") {
            self.webhook.enabled = enabled;
        }
        if let Ok(host) = std::env::var("WEBHOOK_HOST") {
            self.webhook.host = host;
        }
        if let Some(port) = env_parse::<u16>("WEBHOOK_PORT") {
            self.webhook.port = port;
        }
        if let Ok(path) = std::env::var("WEBHOOK_PATH") {
            self.webhook.path = path;
        }
        if let Ok(token) = std::env::var("WEBHOOK_AUTH_TOKEN") {
            self.webhook.auth_token = Some(token);
        }

        if let Some(timeout) = env_parse::<f64>("GRACEFUL_SHUTDOWN_TIMEOUT_S") {
            self.runtime.graceful_shutdown_timeout = timeout;
        }
        if let Some(timeout) = env_parse::<f64>("PROCESS_TIMEOUT_S") {
            self.runtime.process_timeout = timeout;
        }
    }

    /// Worker-loop configuration derived from this config
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            personality: self.agent.personality.clone(),
            goal: self.agent.goal.clone(),
            heartbeat_interval: self.agent.heartbeat_interval,
            command_poll_interval: self.agent.command_poll_interval,
            rest_time: self.agent.rest_time,
            command_retention_hours: self.retention.command_max_age_hours,
            cycle_keep_count: self.retention.cycle_max_keep,
            ..Default::default()
        }
    }

    /// Runtime configuration derived from this config
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            webhook_enabled: self.webhook.enabled,
            webhook_host: self.webhook.host.clone(),
            webhook_port: self.webhook.port,
            webhook_path: self.webhook.path.clone(),
            webhook_auth_token: self.webhook.auth_token.clone(),
            scheduler_check_interval: self.runtime.scheduler_check_interval,
            process_timeout: self.runtime.process_timeout,
            graceful_shutdown_timeout: self.runtime.graceful_shutdown_timeout,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.agent.rest_time, 5.0);
        assert_eq!(config.agent.heartbeat_interval, 10.0);
        assert_eq!(config.paths.state_root, PathBuf::from("./agent_state"));
        assert_eq!(
            config.paths.command_root(),
            PathBuf::from("./agent_state/commands")
        );
        assert!(!config.webhook.enabled);
        assert_eq!(config.retention.cycle_max_keep, 1000);
    }

    #[test]
    fn test_yaml_parse() {
        let yaml = r#"
agent:
  personality: "curious"
  rest-time: 2.5
paths:
  state-root: "/tmp/agent"
webhook:
  enabled: true
  port: 9999
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.agent.personality, "curious");
        assert_eq!(config.agent.rest_time, 2.5);
        assert_eq!(config.paths.state_root, PathBuf::from("/tmp/agent"));
        assert!(config.webhook.enabled);
        assert_eq!(config.webhook.port, 9999);
        // Unspecified sections keep defaults
        assert_eq!(config.runtime.process_timeout, 300.0);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        unsafe {
            std::env::set_var("AGENT_REST_TIME", "0.5");
            std::env::set_var("STATE_ROOT", "/tmp/env_state");
            std::env::set_var("WEBHOOK_ENABLED", "true");
            std::env::set_var("WEBHOOK_AUTH_TOKEN", "sekrit");
            std::env::set_var("CYCLE_MAX_KEEP", "77");
        }

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.agent.rest_time, 0.5);
        assert_eq!(config.paths.state_root, PathBuf::from("/tmp/env_state"));
        assert!(config.webhook.enabled);
        assert_eq!(config.webhook.auth_token.as_deref(), Some("sekrit"));
        assert_eq!(config.retention.cycle_max_keep, 77);

        unsafe {
            std::env::remove_var("AGENT_REST_TIME");
            std::env::remove_var("STATE_ROOT");
            std::env::remove_var("WEBHOOK_ENABLED");
            std::env::remove_var("WEBHOOK_AUTH_TOKEN");
            std::env::remove_var("CYCLE_MAX_KEEP");
        }
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_ignored() {
        unsafe {
            std::env::set_var("AGENT_REST_TIME", "not-a-number");
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.agent.rest_time, 5.0);
        unsafe {
            std::env::remove_var("AGENT_REST_TIME");
        }
    }

    #[test]
    fn test_derived_configs() {
        let mut config = Config::default();
        config.agent.goal = "observe".to_string();
        config.webhook.enabled = true;

        let worker = config.worker_config();
        assert_eq!(worker.goal, "observe");
        assert_eq!(worker.cycle_keep_count, 1000);

        let runtime = config.runtime_config();
        assert!(runtime.webhook_enabled);
        assert_eq!(runtime.process_timeout, 300.0);
    }
}
