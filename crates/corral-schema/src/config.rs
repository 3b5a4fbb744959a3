use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("txn.max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("txn.base_delay_ms ({base}) must not exceed txn.max_delay_ms ({max})")]
    DelayOrder { base: u64, max: u64 },
    #[error("store.backend 'file' requires store.path")]
    MissingStorePath,
    #[error("unknown store backend '{0}', expected 'memory' or 'file'")]
    UnknownBackend(String),
}

/// Top-level configuration for opening a state.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default)]
    pub txn: TxnSection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// Retry budget for optimistic transactions.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TxnSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Back-off before the second attempt; doubled for each further attempt.
    #[serde(default)]
    pub base_delay_ms: u64,
    #[serde(default)]
    pub max_delay_ms: u64,
}

impl Default for TxnSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LifecycleSection {
    /// Remove a unit in one step on destroy when its agent never reported.
    #[serde(default = "default_true")]
    pub short_circuit_destroy: bool,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            short_circuit_destroy: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_backend() -> String {
    "memory".to_owned()
}

impl StateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.txn.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.txn.max_delay_ms != 0 && self.txn.base_delay_ms > self.txn.max_delay_ms {
            return Err(ConfigError::DelayOrder {
                base: self.txn.base_delay_ms,
                max: self.txn.max_delay_ms,
            });
        }
        match self.store.backend.as_str() {
            "memory" => Ok(()),
            "file" if self.store.path.is_some() => Ok(()),
            "file" => Err(ConfigError::MissingStorePath),
            other => Err(ConfigError::UnknownBackend(other.to_owned())),
        }
    }
}

pub fn parse_config_str(input: &str) -> Result<StateConfig, ConfigError> {
    let config: StateConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<StateConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let input = r#"
[txn]
max_attempts = 5
base_delay_ms = 2
max_delay_ms = 50

[lifecycle]
short_circuit_destroy = false

[store]
backend = "file"
path = "/var/lib/corral"
"#;
        let config = parse_config_str(input).expect("should parse");
        assert_eq!(config.txn.max_attempts, 5);
        assert_eq!(config.txn.base_delay_ms, 2);
        assert!(!config.lifecycle.short_circuit_destroy);
        assert_eq!(config.store.backend, "file");
        assert_eq!(config.store.path, Some(PathBuf::from("/var/lib/corral")));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config_str("").expect("should parse");
        assert_eq!(config, StateConfig::default());
        assert_eq!(config.txn.max_attempts, 3);
        assert!(config.lifecycle.short_circuit_destroy);
        assert_eq!(config.store.backend, "memory");
    }

    #[test]
    fn rejects_unknown_fields() {
        let input = r"
[txn]
max_attempts = 3
retries = 9
";
        assert!(matches!(
            parse_config_str(input),
            Err(ConfigError::ParseToml(_))
        ));
    }

    #[test]
    fn rejects_zero_attempts() {
        let input = r"
[txn]
max_attempts = 0
";
        assert!(matches!(
            parse_config_str(input),
            Err(ConfigError::ZeroAttempts)
        ));
    }

    #[test]
    fn rejects_inverted_delays() {
        let input = r"
[txn]
base_delay_ms = 100
max_delay_ms = 10
";
        assert!(matches!(
            parse_config_str(input),
            Err(ConfigError::DelayOrder { base: 100, max: 10 })
        ));
    }

    #[test]
    fn file_backend_requires_path() {
        let input = r#"
[store]
backend = "file"
"#;
        assert!(matches!(
            parse_config_str(input),
            Err(ConfigError::MissingStorePath)
        ));
    }

    #[test]
    fn rejects_unknown_backend() {
        let input = r#"
[store]
backend = "mongo"
"#;
        assert!(matches!(
            parse_config_str(input),
            Err(ConfigError::UnknownBackend(b)) if b == "mongo"
        ));
    }

    #[test]
    fn parses_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.toml");
        fs::write(&path, "[txn]\nmax_attempts = 7\n").unwrap();
        let config = parse_config_file(&path).unwrap();
        assert_eq!(config.txn.max_attempts, 7);
    }

    #[test]
    fn missing_config_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            parse_config_file(dir.path().join("absent.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
