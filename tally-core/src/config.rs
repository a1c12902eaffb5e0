//! Configuration management
//!
//! Settings live in `settings.json` inside the data directory:
//! ```json
//! {
//!   "retry": { "maxAttempts": 5, "baseDelayMs": 10, "maxDelayMs": 500 },
//!   "transactionTimeoutMs": 2000,
//!   "databaseFile": "tally.duckdb"
//! }
//! ```
//! Fields this crate does not manage are kept untouched on save.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::result::{Error, Result};
use crate::services::RetryPolicy;

const SETTINGS_FILE: &str = "settings.json";
const DEFAULT_DATABASE_FILE: &str = "tally.duckdb";

pub const ENV_MAX_ATTEMPTS: &str = "TALLY_MAX_ATTEMPTS";
pub const ENV_TX_TIMEOUT_MS: &str = "TALLY_TX_TIMEOUT_MS";

/// Raw settings.json structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    #[serde(default)]
    retry: RetrySettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transaction_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    database_file: Option<String>,
    #[serde(flatten)]
    other: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    base_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_delay_ms: Option<u64>,
    #[serde(flatten)]
    other: HashMap<String, serde_json::Value>,
}

/// Tally configuration (resolved view of settings plus environment)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub transaction_timeout_ms: Option<u64>,
    pub database_file: String,
}

impl Default for Config {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay.as_millis() as u64,
            max_delay_ms: retry.max_delay.as_millis() as u64,
            transaction_timeout_ms: None,
            database_file: DEFAULT_DATABASE_FILE.to_string(),
        }
    }
}

fn read_settings(dir: &Path) -> Result<SettingsFile> {
    let settings_path = dir.join(SETTINGS_FILE);
    if !settings_path.exists() {
        return Ok(SettingsFile::default());
    }
    let content = std::fs::read_to_string(&settings_path)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::config(format!("invalid {}: {}", settings_path.display(), e)))
}

fn env_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("{} must be a non-negative integer, got {:?}", key, raw))),
        None => Ok(None),
    }
}

impl Config {
    /// Load config from the data directory, applying environment overrides
    pub fn load(dir: &Path) -> Result<Self> {
        Self::load_with_env(dir, |key| std::env::var(key).ok())
    }

    /// Load config using `lookup` in place of the process environment
    pub fn load_with_env(dir: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let raw = read_settings(dir)?;
        let defaults = Self::default();

        let config = Self {
            max_attempts: env_number(&lookup, ENV_MAX_ATTEMPTS)?
                .or(raw.retry.max_attempts)
                .unwrap_or(defaults.max_attempts),
            base_delay_ms: raw.retry.base_delay_ms.unwrap_or(defaults.base_delay_ms),
            max_delay_ms: raw.retry.max_delay_ms.unwrap_or(defaults.max_delay_ms),
            transaction_timeout_ms: env_number(&lookup, ENV_TX_TIMEOUT_MS)?
                .or(raw.transaction_timeout_ms),
            database_file: raw.database_file.unwrap_or(defaults.database_file),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("retry.maxAttempts must be at least 1"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::config(
                "retry.baseDelayMs cannot exceed retry.maxDelayMs",
            ));
        }
        if self.transaction_timeout_ms == Some(0) {
            return Err(Error::config("transactionTimeoutMs must be at least 1"));
        }
        if self.database_file.trim().is_empty() {
            return Err(Error::config("databaseFile cannot be empty"));
        }
        Ok(())
    }

    /// Save config to the data directory.
    /// Preserves other settings that tally doesn't manage.
    pub fn save(&self, dir: &Path) -> Result<()> {
        self.validate()?;
        let mut settings = read_settings(dir)?;

        settings.retry.max_attempts = Some(self.max_attempts);
        settings.retry.base_delay_ms = Some(self.base_delay_ms);
        settings.retry.max_delay_ms = Some(self.max_delay_ms);
        settings.transaction_timeout_ms = self.transaction_timeout_ms;
        settings.database_file = Some(self.database_file.clone());

        let content = serde_json::to_string_pretty(&settings)?;
        std::fs::write(dir.join(SETTINGS_FILE), content)?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn transaction_timeout(&self) -> Option<Duration> {
        self.transaction_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_settings_file() {
        let temp = TempDir::new().unwrap();
        let config = Config::load_with_env(temp.path(), no_env).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.database_file, "tally.duckdb");
        assert_eq!(config.transaction_timeout(), None);
    }

    #[test]
    fn test_settings_file_and_env_overrides() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("settings.json"),
            r#"{"retry": {"maxAttempts": 8, "maxDelayMs": 900}, "transactionTimeoutMs": 100}"#,
        )
        .unwrap();

        let config = Config::load_with_env(temp.path(), no_env).unwrap();
        assert_eq!(config.max_attempts, 8);
        assert_eq!(config.base_delay_ms, 10);
        assert_eq!(config.max_delay_ms, 900);
        assert_eq!(config.transaction_timeout(), Some(Duration::from_millis(100)));

        let config = Config::load_with_env(temp.path(), |key| match key {
            ENV_MAX_ATTEMPTS => Some("3".to_string()),
            ENV_TX_TIMEOUT_MS => Some("250".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.transaction_timeout_ms, Some(250));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");

        std::fs::write(&path, r#"{"retry": {"maxAttempts": 0}}"#).unwrap();
        assert!(matches!(Config::load_with_env(temp.path(), no_env), Err(Error::Config(_))));

        std::fs::write(&path, r#"{"retry": {"baseDelayMs": 50, "maxDelayMs": 5}}"#).unwrap();
        assert!(matches!(Config::load_with_env(temp.path(), no_env), Err(Error::Config(_))));

        std::fs::write(&path, r#"{"transactionTimeoutMs": 0}"#).unwrap();
        assert!(matches!(Config::load_with_env(temp.path(), no_env), Err(Error::Config(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Config::load_with_env(temp.path(), no_env), Err(Error::Config(_))));

        std::fs::remove_file(&path).unwrap();
        let bad_env = |key: &str| (key == ENV_MAX_ATTEMPTS).then(|| "many".to_string());
        assert!(matches!(Config::load_with_env(temp.path(), bad_env), Err(Error::Config(_))));

        let zero_timeout = |key: &str| (key == ENV_TX_TIMEOUT_MS).then(|| "0".to_string());
        assert!(matches!(Config::load_with_env(temp.path(), zero_timeout), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_preserves_unmanaged_fields() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"theme": "dark", "retry": {"maxAttempts": 2, "jitter": "full"}}"#,
        )
        .unwrap();

        let mut config = Config::load_with_env(temp.path(), no_env).unwrap();
        config.max_attempts = 7;
        config.save(temp.path()).unwrap();

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["theme"], "dark");
        assert_eq!(saved["retry"]["jitter"], "full");
        assert_eq!(saved["retry"]["maxAttempts"], 7);
        assert_eq!(saved["databaseFile"], "tally.duckdb");
        assert_eq!(Config::load_with_env(temp.path(), no_env).unwrap().max_attempts, 7);
    }
}
