//! Configuration for the studio, read from `pluffy.toml`.
//!
//! Layered: file → `.env`/environment → CLI flags. Every field has a
//! default, so a missing file or section is not an error.
//!
//! ```toml
//! [server]
//! port = 3141
//! host = "127.0.0.1"
//! db_path = ".pluffy/studio.db"
//! dev_mode = false
//!
//! [agent]
//! name = "code-agent"
//! model = "gemini-2.0-flash"
//! api_key_env = "GEMINI_API_KEY"
//! offline = false
//!
//! [queue]
//! poll_interval_ms = 500
//! max_attempts = 3
//! visibility_timeout_secs = 300
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::studio::agent::{
    AgentProvider, AgentSpec, DEFAULT_AGENT_NAME, DEFAULT_API_BASE, DEFAULT_MODEL,
    DEFAULT_SYSTEM_PROMPT, GeminiProvider, StubProvider,
};
use crate::studio::queue::QueuePolicy;
use crate::studio::server::ServerConfig;

pub const DEFAULT_CONFIG_PATH: &str = ".pluffy/pluffy.toml";

/// `[agent]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_system")]
    pub system: String,
    /// Environment variable holding the model API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Use the built-in stub agent instead of calling a model.
    #[serde(default)]
    pub offline: bool,
}

fn default_agent_name() -> String {
    DEFAULT_AGENT_NAME.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_system() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            model: default_model(),
            system: default_system(),
            api_key_env: default_api_key_env(),
            api_base: default_api_base(),
            offline: false,
        }
    }
}

impl AgentConfig {
    pub fn spec(&self) -> AgentSpec {
        AgentSpec {
            name: self.name.clone(),
            system: self.system.clone(),
            model: self.model.clone(),
        }
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    pub fn provider(&self) -> Arc<dyn AgentProvider> {
        if self.offline {
            Arc::new(StubProvider::new())
        } else {
            Arc::new(GeminiProvider::new(&self.api_base, self.api_key()))
        }
    }
}

/// `[queue]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Failed attempts are retried after one poll interval.
    pub fn policy(&self) -> QueuePolicy {
        QueuePolicy {
            max_attempts: self.max_attempts,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            retry_delay: self.poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudioConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl StudioConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pluffy.toml")
    }

    /// Load from `path`, or defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// File, then `.env` and process environment.
    pub fn load_layered(path: &Path) -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "failed to load .env");
            }
        }
        let mut config = Self::load_or_default(path)?;
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize pluffy.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `PLUFFY_PORT` and `PLUFFY_DB_PATH` using the given lookup.
    pub fn apply_env_with(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = get("PLUFFY_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid PLUFFY_PORT '{}'", port))?;
        }
        if let Some(db_path) = get("PLUFFY_DB_PATH") {
            if !db_path.trim().is_empty() {
                self.server.db_path = PathBuf::from(db_path);
            }
        }
        Ok(())
    }

    /// Non-fatal problems worth telling the user about.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.queue.max_attempts == 0 {
            warnings.push("queue.max_attempts is 0: jobs fail on their first error".to_string());
        }
        if self.queue.poll_interval_ms == 0 {
            warnings.push("queue.poll_interval_ms is 0: the worker will busy-poll".to_string());
        }
        if self.queue.visibility_timeout_secs == 0 {
            warnings.push(
                "queue.visibility_timeout_secs is 0: every agent call times out".to_string(),
            );
        }
        if !self.agent.offline && self.agent.api_key().is_none() {
            warnings.push(format!(
                "{} is not set: jobs will fail until it is (or set agent.offline = true)",
                self.agent.api_key_env
            ));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = StudioConfig::default();
        assert_eq!(config.server.port, 3141);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.db_path, PathBuf::from(".pluffy/studio.db"));
        assert_eq!(config.agent.name, "code-agent");
        assert_eq!(config.agent.model, "gemini-2.0-flash");
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.policy().visibility_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_parse_partial_file_keeps_other_defaults() {
        let config = StudioConfig::parse(
            r#"
[server]
port = 8080

[agent]
offline = true
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.agent.offline);
        assert_eq!(config.agent.model, "gemini-2.0-flash");
        assert_eq!(config.queue.poll_interval_ms, 500);
    }

    #[test]
    fn test_parse_invalid_toml_fails() {
        assert!(StudioConfig::parse("[server\nport = ").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = StudioConfig::load_or_default(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, StudioConfig::default());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/pluffy.toml");
        let mut config = StudioConfig::default();
        config.queue.max_attempts = 7;
        config.save(&path).unwrap();
        assert_eq!(StudioConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> =
            HashMap::from([("PLUFFY_PORT", "9000"), ("PLUFFY_DB_PATH", "/tmp/x.db")]);
        let mut config = StudioConfig::default();
        config
            .apply_env_with(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.db_path, PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn test_invalid_env_port_is_an_error() {
        let mut config = StudioConfig::default();
        let err = config
            .apply_env_with(|k| (k == "PLUFFY_PORT").then(|| "abc".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PLUFFY_PORT"));
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = StudioConfig::default();
        config.agent.offline = true;
        assert!(config.validate().is_empty());

        config.queue.max_attempts = 0;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("max_attempts"));

        config.agent.offline = false;
        config.agent.api_key_env = "PLUFFY_TEST_KEY_THAT_IS_NEVER_SET".into();
        assert!(config.validate().iter().any(|w| w.contains("PLUFFY_TEST_KEY_THAT_IS_NEVER_SET")));
    }

    #[test]
    fn test_agent_spec_from_config() {
        let mut agent = AgentConfig::default();
        agent.model = "gemini-2.5-pro".into();
        let spec = agent.spec();
        assert_eq!(spec.model, "gemini-2.5-pro");
        assert_eq!(spec.name, "code-agent");
    }
}
