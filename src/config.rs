//! Client configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! `TURNSTREAM_*` environment variables. CLI flags are applied last by the
//! binary.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

pub const ENV_BASE_URL: &str = "TURNSTREAM_BASE_URL";
pub const ENV_CHANNEL_URL: &str = "TURNSTREAM_CHANNEL_URL";
pub const ENV_MODEL: &str = "TURNSTREAM_MODEL";
pub const ENV_SYSTEM_PROMPT: &str = "TURNSTREAM_SYSTEM_PROMPT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Root of the persistence and streaming HTTP API.
    pub base_url: String,
    /// Path of the streaming generation endpoint, relative to `base_url`.
    pub stream_path: String,
    /// Notification channel root. Derived from `base_url` when unset.
    pub channel_url: Option<String>,
    pub model: String,
    pub system_prompt: String,
    /// Root that server-relative image paths are joined onto.
    pub image_base_url: Option<String>,
    /// Fixed delay between a channel close and the next connect attempt.
    pub reconnect_delay_ms: u64,
    /// Consecutive channel failures before logging escalates to `error`.
    pub failure_log_threshold: u32,
    pub connect_timeout_ms: u64,
    /// Whole-request timeout for persistence calls. The streaming request is
    /// never bounded by it.
    pub request_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            stream_path: "/api/chat/send".to_string(),
            channel_url: None,
            model: "deepseek-chat".to_string(),
            system_prompt: "You are a helpful assistant".to_string(),
            image_base_url: None,
            reconnect_delay_ms: 3_000,
            failure_log_threshold: 5,
            connect_timeout_ms: 3_000,
            request_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    /// Defaults, overlaid with `path` when given, overlaid with the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
            .map_err(|e| ChatError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ChatError::Config(e.to_string()))
    }

    /// Overlay environment values. `lookup` stands in for `std::env::var` so
    /// tests do not touch process state.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty(ENV_BASE_URL) {
            self.base_url = v;
        }
        if let Some(v) = non_empty(ENV_CHANNEL_URL) {
            self.channel_url = Some(v);
        }
        if let Some(v) = non_empty(ENV_MODEL) {
            self.model = v;
        }
        if let Some(v) = non_empty(ENV_SYSTEM_PROMPT) {
            self.system_prompt = v;
        }
    }

    pub fn stream_url(&self) -> String {
        join_url(&self.base_url, &self.stream_path)
    }

    /// `ws://host/ws` for an `http://host` base, `wss://` for `https://`.
    pub fn channel_url(&self) -> String {
        if let Some(url) = &self.channel_url {
            return url.trim_end_matches('/').to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws}/ws")
    }

    pub fn image_base_url(&self) -> &str {
        self.image_base_url.as_deref().unwrap_or(&self.base_url)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_match_backend_conventions() {
        let c = ClientConfig::default();
        assert_eq!(c.base_url, "http://localhost:8000");
        assert_eq!(c.model, "deepseek-chat");
        assert_eq!(c.reconnect_delay(), Duration::from_secs(3));
        assert_eq!(c.failure_log_threshold, 5);
        assert!(c.request_timeout().is_none());
    }

    #[test]
    fn channel_url_is_derived_from_base() {
        let mut c = ClientConfig::default();
        assert_eq!(c.channel_url(), "ws://localhost:8000/ws");
        c.base_url = "https://chat.example.com/".into();
        assert_eq!(c.channel_url(), "wss://chat.example.com/ws");
        c.channel_url = Some("ws://push.example.com/events/".into());
        assert_eq!(c.channel_url(), "ws://push.example.com/events");
    }

    #[test]
    fn stream_url_joins_cleanly() {
        let mut c = ClientConfig::default();
        c.base_url = "http://h:1/".into();
        assert_eq!(c.stream_url(), "http://h:1/api/chat/send");
    }

    #[test]
    fn image_base_defaults_to_base_url() {
        let mut c = ClientConfig::default();
        assert_eq!(c.image_base_url(), "http://localhost:8000");
        c.image_base_url = Some("http://cdn".into());
        assert_eq!(c.image_base_url(), "http://cdn");
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let c = ClientConfig::from_toml_str("model = \"deepseek-reasoner\"\nreconnect_delay_ms = 500\n")
            .unwrap();
        assert_eq!(c.model, "deepseek-reasoner");
        assert_eq!(c.reconnect_delay_ms, 500);
        assert_eq!(c.base_url, "http://localhost:8000");
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = ClientConfig::from_toml_str("reconnect_delay_ms = \"soon\"").unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn loads_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "base_url = \"http://10.0.0.2:9000\"").unwrap();
        writeln!(f, "system_prompt = \"be brief\"").unwrap();
        let c = ClientConfig::from_file(f.path()).unwrap();
        assert_eq!(c.base_url, "http://10.0.0.2:9000");
        assert_eq!(c.system_prompt, "be brief");
        assert_eq!(c.channel_url(), "ws://10.0.0.2:9000/ws");
    }

    #[test]
    fn missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClientConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_MODEL, "env-model"),
            (ENV_CHANNEL_URL, "ws://env/ws"),
            (ENV_SYSTEM_PROMPT, "  "),
        ]
        .into_iter()
        .collect();
        let mut c = ClientConfig::from_toml_str("model = \"file-model\"").unwrap();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.model, "env-model");
        assert_eq!(c.channel_url(), "ws://env/ws");
        assert_eq!(c.system_prompt, "You are a helpful assistant");
    }
}
