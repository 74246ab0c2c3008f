//! Server configuration.
//!
//! Defaults, then an optional TOML file, then `LACQUER_`-prefixed environment
//! variables, merged in that order. Provider base URLs additionally honor the
//! flat `LACQUER_<PROVIDER>_BASE_URL` variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::LacquerError;

/// Per-provider settings from the `[providers.<name>]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Executable for subprocess-backed providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl ProviderSettings {
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum concurrently running workflow executions.
    pub concurrency: usize,
    /// Seconds.
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub idle_timeout: u64,
    pub shutdown_timeout: u64,
    pub enable_metrics: bool,
    pub enable_cors: bool,
    #[serde(default)]
    pub workflow_files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub disable_model_cache: bool,
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            concurrency: 10,
            read_timeout: 30,
            write_timeout: 30,
            idle_timeout: 120,
            shutdown_timeout: 30,
            enable_metrics: true,
            enable_cors: false,
            workflow_files: Vec::new(),
            workflow_dir: None,
            cache_dir: None,
            disable_model_cache: false,
            providers: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration, optionally merging a TOML file.
    pub fn load(path: Option<&Path>) -> Result<Self, LacquerError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(LacquerError::Configuration(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let mut config: Self = figment
            .merge(Env::prefixed("LACQUER_").split("__"))
            .extract()
            .map_err(|err| LacquerError::Configuration(err.to_string()))?;
        config.apply_flat_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// `LACQUER_ANTHROPIC_BASE_URL`-style overrides for provider endpoints.
    fn apply_flat_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        for provider in ["anthropic", "openai", "claude_code"] {
            let var = format!("LACQUER_{}_BASE_URL", provider.to_uppercase());
            if let Some(base_url) = env(&var) {
                self.providers
                    .entry(provider.to_string())
                    .or_default()
                    .base_url = Some(base_url);
            }
        }
    }

    pub fn provider(&self, name: &str) -> ProviderSettings {
        self.providers.get(name).cloned().unwrap_or_default()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// Cache root for the model catalog; falls back beside the current dir.
    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".lacquer-cache"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.concurrency, 10);
        assert!(config.enable_metrics);
        assert!(!config.enable_cors);
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lacquer.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
port = 9000
concurrency = 2
enable_cors = true
workflow_dir = "flows"

[providers.anthropic]
base_url = "http://localhost:9999"
timeout = 5
"#
        )
        .unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.concurrency, 2);
        assert!(config.enable_cors);
        assert_eq!(config.workflow_dir, Some(PathBuf::from("flows")));

        let anthropic = config.provider("anthropic");
        assert_eq!(anthropic.base_url.as_deref(), Some("http://localhost:9999"));
        assert_eq!(anthropic.timeout_duration(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_missing_config_file_errors() {
        let err = ServerConfig::load(Some(Path::new("/nonexistent/lacquer.toml"))).unwrap_err();
        assert!(matches!(err, LacquerError::Configuration(_)));
    }

    #[test]
    fn test_flat_env_overrides() {
        let mut config = ServerConfig::default();
        config.apply_flat_env_overrides(|name| {
            (name == "LACQUER_ANTHROPIC_BASE_URL").then(|| "http://override:1".to_string())
        });
        assert_eq!(
            config.provider("anthropic").base_url.as_deref(),
            Some("http://override:1")
        );
        assert!(config.provider("openai").base_url.is_none());
    }
}
