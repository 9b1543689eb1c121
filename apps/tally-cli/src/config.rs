//! # Runner Configuration
//!
//! Configuration management for the `tally` binary.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Command-line flags (highest priority)                              │
//! │     --precision 4 --strict --strategy equal                            │
//! │                                                                         │
//! │  2. Environment Variables                                              │
//! │     TALLY_PRECISION=4                                                  │
//! │     TALLY_STRICT=true                                                  │
//! │     TALLY_ALLOCATION_STRATEGY=by_gross                                 │
//! │     TALLY_LOG=debug                                                    │
//! │                                                                         │
//! │  3. TOML Config File                                                   │
//! │     --config <path>, or                                                │
//! │     ~/.config/tally/tally.toml (Linux)                                 │
//! │     ~/Library/Application Support/com.tally.tally/tally.toml (macOS)   │
//! │                                                                         │
//! │  4. Default Values (lowest priority)                                   │
//! │     precision 2, lenient, by_net, pretty output, warn                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # tally.toml
//! [engine]
//! precision = 2
//! strict = false               # omit to let each policy decide
//! allocation_strategy = "by_net"  # by_net | by_gross | by_quantity | equal
//!
//! [output]
//! pretty = true
//!
//! [logging]
//! level = "warn"
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tally_core::decimal::{DEFAULT_PRECISION, MAX_PRECISION};
use tally_core::{AllocationStrategy, Options};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, ConfigResult};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

// =============================================================================
// Engine Settings
// =============================================================================

/// Defaults handed to the engine on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Decimal places of money results (0-10).
    #[serde(default = "default_precision")]
    pub precision: u32,

    /// Forces strict or lenient mode. Unset lets the policy decide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,

    /// How order-scoped amounts are spread over lines.
    #[serde(default)]
    pub allocation_strategy: AllocationStrategy,
}

fn default_precision() -> u32 {
    DEFAULT_PRECISION
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            precision: default_precision(),
            strict: None,
            allocation_strategy: AllocationStrategy::default(),
        }
    }
}

impl EngineSettings {
    pub fn options(&self) -> Options {
        Options {
            precision: self.precision,
            strict: self.strict,
            allocation_strategy: self.allocation_strategy,
        }
    }
}

// =============================================================================
// Output & Logging Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Pretty-print response JSON.
    #[serde(default = "default_true")]
    pub pretty: bool,
}

fn default_true() -> bool {
    true
}

impl Default for OutputSettings {
    fn default() -> Self {
        OutputSettings { pretty: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Fallback filter when `RUST_LOG` is not set.
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "warn".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: default_level(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Where the file layer of a [`TallyConfig`] came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    #[default]
    Defaults,
    File(PathBuf),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Defaults => write!(f, "defaults"),
            ConfigSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Complete runner configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub output: OutputSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(skip)]
    pub source: ConfigSource,
}

impl TallyConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tally.toml)
    /// 3. Environment variables
    ///
    /// An explicit `config_path` must exist; the default path may not.
    pub fn load(config_path: Option<PathBuf>) -> ConfigResult<Self> {
        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_config_path() {
                Some(path) if path.exists() => Self::from_file(path)?,
                Some(path) => {
                    debug!(?path, "Config file not found, using defaults");
                    Self::default()
                }
                None => Self::default(),
            },
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: PathBuf) -> ConfigResult<Self> {
        info!(?path, "Loading config from file");
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.source = ConfigSource::File(path);
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.engine.precision > MAX_PRECISION {
            return Err(ConfigError::Invalid(format!(
                "engine.precision must be between 0 and {}, got {}",
                MAX_PRECISION, self.engine.precision
            )));
        }

        let level = self.logging.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Unknown log level: '{}'. Valid options: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }

        Ok(())
    }

    /// Applies `TALLY_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`. Unparseable values are ignored with
    /// a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(precision) = lookup("TALLY_PRECISION") {
            match precision.trim().parse::<u32>() {
                Ok(p) => {
                    debug!(precision = p, "Overriding precision from environment");
                    self.engine.precision = p;
                }
                Err(_) => warn!(value = %precision, "Ignoring invalid TALLY_PRECISION"),
            }
        }

        if let Some(strict) = lookup("TALLY_STRICT") {
            match parse_bool(&strict) {
                Some(s) => self.engine.strict = Some(s),
                None => warn!(value = %strict, "Ignoring invalid TALLY_STRICT"),
            }
        }

        if let Some(strategy) = lookup("TALLY_ALLOCATION_STRATEGY") {
            match strategy.parse::<AllocationStrategy>() {
                Ok(parsed) => {
                    debug!(strategy = %parsed, "Overriding allocation strategy from environment");
                    self.engine.allocation_strategy = parsed;
                }
                Err(e) => warn!(error = %e, "Ignoring invalid TALLY_ALLOCATION_STRATEGY"),
            }
        }

        if let Some(level) = lookup("TALLY_LOG") {
            self.logging.level = level;
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "tally")
            .map(|dirs| dirs.config_dir().join("tally.toml"))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = TallyConfig::default();
        assert_eq!(config.engine.precision, 2);
        assert_eq!(config.engine.strict, None);
        assert_eq!(config.engine.allocation_strategy, AllocationStrategy::ByNet);
        assert!(config.output.pretty);
        assert_eq!(config.logging.level, "warn");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config = TallyConfig::from_toml(
            r#"
            [engine]
            precision = 4
            strict = true
            allocation_strategy = "by_quantity"

            [output]
            pretty = false
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.precision, 4);
        assert_eq!(config.engine.strict, Some(true));
        assert_eq!(config.engine.allocation_strategy, AllocationStrategy::ByQuantity);
        assert!(!config.output.pretty);
        // Missing sections fall back to defaults.
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_parse_toml_rejects_unknown_strategy() {
        let result = TallyConfig::from_toml("[engine]\nallocation_strategy = \"weighted\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TallyConfig::default();
        config.apply_overrides(env(&[
            ("TALLY_PRECISION", "3"),
            ("TALLY_STRICT", "yes"),
            ("TALLY_ALLOCATION_STRATEGY", "even"),
            ("TALLY_LOG", "debug"),
        ]));
        assert_eq!(config.engine.precision, 3);
        assert_eq!(config.engine.strict, Some(true));
        assert_eq!(config.engine.allocation_strategy, AllocationStrategy::Equal);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let mut config = TallyConfig::default();
        config.apply_overrides(env(&[
            ("TALLY_PRECISION", "two"),
            ("TALLY_STRICT", "maybe"),
            ("TALLY_ALLOCATION_STRATEGY", "weighted"),
        ]));
        assert_eq!(config, TallyConfig::default());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TallyConfig::default();
        config.engine.precision = 11;
        assert!(config.validate().is_err());

        config.engine.precision = 10;
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "INFO".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_options_from_settings() {
        let settings = EngineSettings {
            precision: 3,
            strict: Some(false),
            allocation_strategy: AllocationStrategy::ByGross,
        };
        let options = settings.options();
        assert_eq!(options.precision, 3);
        assert_eq!(options.strict, Some(false));
        assert_eq!(options.allocation_strategy, AllocationStrategy::ByGross);
    }

    #[test]
    fn test_toml_serialization() {
        let toml_str = toml::to_string_pretty(&TallyConfig::default()).unwrap();
        assert!(toml_str.contains("[engine]"));
        assert!(toml_str.contains("[logging]"));
        assert!(!toml_str.contains("source"));
    }

    #[test]
    fn test_load_records_file_source() {
        let path = std::env::temp_dir().join(format!("tally-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[engine]\nprecision = 3\n").unwrap();

        let config = TallyConfig::load(Some(path.clone())).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.source, ConfigSource::File(path.clone()));
        assert_eq!(config.source.to_string(), path.display().to_string());
        assert_eq!(TallyConfig::from_toml("").unwrap().source, ConfigSource::Defaults);
        assert_eq!(ConfigSource::Defaults.to_string(), "defaults");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let path = std::env::temp_dir().join("tally-config-does-not-exist.toml");
        assert!(matches!(
            TallyConfig::load(Some(path)),
            Err(ConfigError::Read { .. })
        ));
    }
}
