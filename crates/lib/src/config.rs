//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (`~/.tether/config.json` by default) and environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::health::HealthConfig;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// How the backend process is started or reached.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Liveness probing and recovery.
    #[serde(default)]
    pub health: HealthSection,

    /// Streaming endpoints.
    #[serde(default)]
    pub streams: StreamsConfig,
}

/// Backend process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Program to spawn. Required unless `address` is set.
    pub command: Option<String>,

    /// Arguments; `{port}` is replaced with the chosen port.
    #[serde(default)]
    pub args: Vec<String>,

    /// Bind address the backend listens on (default "127.0.0.1").
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to pass to the backend; 0 picks a free port (default 0).
    #[serde(default)]
    pub port: u16,

    /// How long a spawned backend may take to answer its liveness path.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Attach to an already running backend instead of spawning one.
    /// Overridden by TETHER_BACKEND_URL env.
    pub address: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_ready_timeout_ms() -> u64 {
    30_000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            bind: default_bind(),
            port: 0,
            ready_timeout_ms: default_ready_timeout_ms(),
            address: None,
        }
    }
}

impl BackendConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Health monitor settings as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthSection {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_failures: u32,
    pub recovery_delay_ms: u64,
    pub stabilize_delay_ms: u64,
    /// Liveness path (default "/health").
    pub path: String,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 5_000,
            max_failures: 3,
            recovery_delay_ms: 2_000,
            stabilize_delay_ms: 1_000,
            path: "/health".to_string(),
        }
    }
}

impl HealthSection {
    pub fn to_health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(self.interval_ms.max(1)),
            timeout: Duration::from_millis(self.timeout_ms),
            max_failures: self.max_failures,
            recovery_delay: Duration::from_millis(self.recovery_delay_ms),
            stabilize_delay: Duration::from_millis(self.stabilize_delay_ms),
        }
    }
}

/// Streaming and request/response endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamsConfig {
    pub chat_path: String,
    /// Contains `{task_id}`.
    pub task_path: String,
    /// Default timeout for request/response calls.
    pub request_timeout_ms: u64,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            chat_path: "/api/chat/stream".to_string(),
            task_path: "/api/tasks/{task_id}/stream".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl StreamsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the backend address: env TETHER_BACKEND_URL overrides config.
/// `None` means a backend must be spawned.
pub fn resolve_backend_address(config: &Config) -> Option<String> {
    non_empty(std::env::var("TETHER_BACKEND_URL").ok())
        .or_else(|| non_empty(config.backend.address.clone()))
}

/// Config file path: TETHER_CONFIG_PATH, else `~/.tether/config.json`.
pub fn default_config_path() -> PathBuf {
    std::env::var("TETHER_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".tether").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path or the default one. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.backend.bind, "127.0.0.1");
        assert_eq!(config.backend.port, 0);
        assert_eq!(config.backend.ready_timeout(), Duration::from_secs(30));
        assert_eq!(config.health.to_health_config(), HealthConfig::default());
        assert_eq!(config.health.path, "/health");
        assert_eq!(config.streams.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "backend": { "command": "python", "args": ["-m", "app", "--port", "{port}"] },
                "health": { "maxFailures": 5, "intervalMs": 1000 },
                "streams": { "chatPath": "/v2/chat" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.backend.command.as_deref(), Some("python"));
        assert_eq!(config.backend.args.len(), 4);
        assert_eq!(config.backend.ready_timeout_ms, 30_000);
        let health = config.health.to_health_config();
        assert_eq!(health.max_failures, 5);
        assert_eq!(health.interval, Duration::from_secs(1));
        assert_eq!(health.timeout, Duration::from_secs(5));
        assert_eq!(config.streams.chat_path, "/v2/chat");
        assert_eq!(config.streams.task_path, "/api/tasks/{task_id}/stream");
    }

    #[test]
    fn zero_interval_is_clamped() {
        let section = HealthSection {
            interval_ms: 0,
            ..HealthSection::default()
        };
        assert_eq!(section.to_health_config().interval, Duration::from_millis(1));
    }

    #[test]
    fn blank_values_are_treated_as_unset() {
        assert_eq!(non_empty(Some("  ".to_string())), None);
        assert_eq!(
            non_empty(Some(" http://127.0.0.1:8000 ".to_string())).as_deref(),
            Some("http://127.0.0.1:8000")
        );
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path =
            std::env::temp_dir().join(format!("tether-missing-{}.json", uuid::Uuid::new_v4()));
        let (config, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert!(config.backend.command.is_none());
    }

    #[test]
    fn malformed_file_reports_path() {
        let path = std::env::temp_dir().join(format!("tether-bad-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_config(Some(path.clone())).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(format!("{:#}", err).contains("parsing config"));
    }
}
