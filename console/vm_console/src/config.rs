// File: console/vm_console/src/config.rs

use std::fs::File;
use std::io::Read;
use std::path::Path;
use serde::{Serialize, Deserialize};
use url::Url;
use power_tracker::TrackerConfig;
use crate::api_client::ApiClientConfig;
use crate::error::{Result, ConsoleError};

pub const DEFAULT_CONFIG_PATH: &str = "vm_console.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiClientConfig,
    pub tracker: TrackerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // If the file doesn't exist, return the default config
        if !path.exists() {
            return Ok(Self::default());
        }

        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: toml::Value = toml::from_str(contents)
            .map_err(|e| ConsoleError::ConfigError(format!("Failed to parse config: {}", e)))?;

        let defaults = Self::default();

        // Every section is optional; missing keys keep their defaults
        let api = match config.get("api") {
            Some(api) => ApiClientConfig {
                api_url: api.get("url")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or(defaults.api.api_url),
                timeout_ms: unsigned(api, "timeout_ms")?
                    .unwrap_or(defaults.api.timeout_ms),
                max_retries: unsigned(api, "max_retries")?
                    .unwrap_or(defaults.api.max_retries),
                retry_delay_ms: unsigned(api, "retry_delay_ms")?
                    .unwrap_or(defaults.api.retry_delay_ms),
                username: api.get("username")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                org: api.get("org")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                password: api.get("password")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            },
            None => defaults.api,
        };

        let tracker: TrackerConfig = match config.get("tracker") {
            Some(tracker) => tracker.clone()
                .try_into()
                .map_err(|e| ConsoleError::ConfigError(format!("Invalid tracker section: {}", e)))?,
            None => defaults.tracker,
        };

        let logging = LoggingConfig {
            level: config.get("logging")
                .and_then(|l| l.get("level"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or(defaults.logging.level),
        };

        Ok(Self { api, tracker, logging })
    }

    // Environment variables win over file values
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("VM_CONSOLE_API_URL") {
            self.api.api_url = url;
        }
        if let Some(username) = lookup("VM_CONSOLE_USERNAME") {
            self.api.username = Some(username);
        }
        if let Some(password) = lookup("VM_CONSOLE_PASSWORD") {
            self.api.password = Some(password);
        }
        if let Some(org) = lookup("VM_CONSOLE_ORG") {
            self.api.org = Some(org);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.api.api_url)
            .map_err(|e| ConsoleError::ConfigError(format!("Invalid API url {}: {}", self.api.api_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConsoleError::ConfigError(format!("Unsupported API url scheme: {}", url.scheme())));
        }

        if self.api.max_retries == 0 {
            return Err(ConsoleError::ConfigError("max_retries must be at least 1".to_string()));
        }

        self.tracker.validate()?;
        Ok(())
    }
}

// Read an optional non-negative integer from the [api] section
fn unsigned<T: TryFrom<i64>>(section: &toml::Value, key: &str) -> Result<Option<T>> {
    match section.get(key) {
        None => Ok(None),
        Some(value) => value.as_integer()
            .and_then(|v| T::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| ConsoleError::ConfigError(format!("api.{} must be a non-negative integer, got {}", key, value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use assert_matches::assert_matches;
    use power_tracker::PollStrategy;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load("/nonexistent/vm_console.toml").unwrap();
        assert_eq!(config.api.api_url, "http://127.0.0.1:8443");
        assert_eq!(config.tracker, TrackerConfig::default());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"
[api]
url = "https://vcd.example.com"
max_retries = 5
username = "admin"
org = "System"

[tracker]
poll_interval_ms = 1000
strategy = "concurrent"

[logging]
level = "debug"
"#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.api.api_url, "https://vcd.example.com");
        assert_eq!(config.api.max_retries, 5);
        assert_eq!(config.api.timeout_ms, 5000);
        assert_eq!(config.api.username.as_deref(), Some("admin"));
        assert_eq!(config.api.org.as_deref(), Some("System"));
        assert!(config.api.password.is_none());
        assert_eq!(config.tracker.poll_interval_ms, 1000);
        assert_eq!(config.tracker.removal_delay_ms, 2000);
        assert_eq!(config.tracker.strategy, PollStrategy::Concurrent);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_file_rejected() {
        let result = Config::parse("[api\nurl = ");
        assert_matches!(result, Err(ConsoleError::ConfigError(_)));

        let result = Config::parse("[tracker]\npoll_interval_ms = \"fast\"");
        assert_matches!(result, Err(ConsoleError::ConfigError(msg)) if msg.contains("tracker"));
    }

    #[test]
    fn test_out_of_range_integers_rejected() {
        let result = Config::parse("[api]\nmax_retries = -1");
        assert_matches!(result, Err(ConsoleError::ConfigError(msg)) if msg.contains("max_retries"));

        let result = Config::parse("[api]\nmax_retries = 4294967296");
        assert_matches!(result, Err(ConsoleError::ConfigError(msg)) if msg.contains("max_retries"));

        let result = Config::parse("[api]\nretry_delay_ms = -5");
        assert_matches!(result, Err(ConsoleError::ConfigError(msg)) if msg.contains("retry_delay_ms"));

        let result = Config::parse("[api]\ntimeout_ms = \"soon\"");
        assert_matches!(result, Err(ConsoleError::ConfigError(msg)) if msg.contains("timeout_ms"));

        let config = Config::parse("[api]\nmax_retries = 2\ntimeout_ms = 0").unwrap();
        assert_eq!(config.api.max_retries, 2);
        assert_eq!(config.api.timeout_ms, 0);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("VM_CONSOLE_API_URL", "https://override.example.com"),
            ("VM_CONSOLE_PASSWORD", "secret"),
        ].into_iter().collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.api.api_url, "https://override.example.com");
        assert_eq!(config.api.password.as_deref(), Some("secret"));
        assert!(config.api.username.is_none());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.api.api_url = "not a url".to_string();
        assert_matches!(config.validate(), Err(ConsoleError::ConfigError(_)));

        config.api.api_url = "ftp://vcd.example.com".to_string();
        assert_matches!(config.validate(), Err(ConsoleError::ConfigError(msg)) if msg.contains("scheme"));

        let mut config = Config::default();
        config.tracker.safety_net_delay_ms = 0;
        assert_matches!(config.validate(), Err(ConsoleError::TrackerError(_)));
    }
}
