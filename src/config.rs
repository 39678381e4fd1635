use std::env;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Path joined onto `base_url` for forwarded chat-completion calls.
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    /// Lightweight status path used by the background health probe.
    #[serde(default = "default_status_path")]
    pub status_path: String,
    #[serde(default)]
    pub auth: UpstreamAuth,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_path: default_chat_path(),
            status_path: default_status_path(),
            auth: UpstreamAuth::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamAuth {
    /// Bearer credential, stored inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Environment variable name for the bearer credential (preferred over
    /// storing secrets on disk).
    #[serde(default = "default_auth_token_env", skip_serializing_if = "Option::is_none")]
    pub auth_token_env: Option<String>,
}

impl Default for UpstreamAuth {
    fn default() -> Self {
        Self {
            auth_token: None,
            auth_token_env: default_auth_token_env(),
        }
    }
}

impl UpstreamAuth {
    pub fn resolve_auth_token(&self) -> Option<String> {
        if let Some(token) = self.auth_token.as_deref()
            && !token.trim().is_empty()
        {
            return Some(token.to_string());
        }
        if let Some(env_name) = self.auth_token_env.as_deref()
            && let Ok(v) = env::var(env_name)
            && !v.trim().is_empty()
        {
            return Some(v);
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// First port tried; the server walks upward until one binds.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Discovery file overwritten with the bound port once listening.
    #[serde(default = "default_registry_file")]
    pub registry_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            registry_file: default_registry_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    #[serde(default = "default_probe_secs")]
    pub probe_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: default_request_secs(),
            probe_secs: default_probe_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_retry_jitter_ms")]
    pub jitter_ms: u64,
    /// Statuses worth retrying, e.g. "429,500-599".
    #[serde(default = "default_retry_on_status")]
    pub on_status: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            backoff_ms: default_retry_backoff_ms(),
            backoff_max_ms: default_retry_backoff_max_ms(),
            jitter_ms: default_retry_jitter_ms(),
            on_status: default_retry_on_status(),
        }
    }
}

fn default_base_url() -> String {
    "https://spark-api-open.xf-yun.com".to_string()
}

fn default_chat_path() -> String {
    "/v2/chat/completions".to_string()
}

fn default_status_path() -> String {
    "/v1/api/status".to_string()
}

fn default_auth_token_env() -> Option<String> {
    Some("SPARK_API_PASSWORD".to_string())
}

fn default_base_port() -> u16 {
    3001
}

fn default_registry_file() -> PathBuf {
    PathBuf::from("proxy-port.json")
}

fn default_request_secs() -> u64 {
    30
}

fn default_probe_secs() -> u64 {
    5
}

fn default_health_interval_secs() -> u64 {
    5 * 60
}

fn default_retry_max_attempts() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_retry_backoff_max_ms() -> u64 {
    10_000
}

fn default_retry_jitter_ms() -> u64 {
    250
}

fn default_retry_on_status() -> String {
    "429,500-599".to_string()
}

/// Loads the proxy config from an explicit path, or from the first of
/// `./spark-proxy.toml` and `~/.spark-proxy/config.toml` that exists.
/// Built-in defaults apply when no file is found.
pub async fn load_config(path: Option<&Path>) -> Result<ProxyConfig> {
    if let Some(path) = path {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        return Ok(cfg);
    }

    for candidate in default_config_paths() {
        match tokio::fs::read_to_string(&candidate).await {
            Ok(text) => {
                let cfg = toml::from_str(&text)
                    .with_context(|| format!("failed to parse config file {}", candidate.display()))?;
                info!("loaded config from {}", candidate.display());
                return Ok(cfg);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config file {}", candidate.display()));
            }
        }
    }

    Ok(ProxyConfig::default())
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut out = vec![PathBuf::from("spark-proxy.toml")];
    if let Some(home) = home_dir() {
        out.push(home.join(".spark-proxy").join("config.toml"));
    }
    out
}
