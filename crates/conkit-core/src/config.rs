use crate::error::{ConkitError, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Environment prefix for overrides, e.g. `CONKIT__POOL__UNIT_SIZE=4096`.
pub const ENV_PREFIX: &str = "CONKIT";

/// Top-level configuration for conkit consumers.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ConkitConfig {
    /// Fixed-block memory pool sizing
    #[serde(default)]
    pub pool: PoolConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sizing for [`crate::memory::MemoryPool`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of units carved out of the arena
    #[serde(default = "PoolConfig::default_unit_number")]
    pub unit_number: usize,

    /// Bytes per unit; larger requests bypass the pool
    #[serde(default = "PoolConfig::default_unit_size")]
    pub unit_size: usize,
}

impl PoolConfig {
    fn default_unit_number() -> usize {
        50
    }

    fn default_unit_size() -> usize {
        1024
    }

    /// Total arena size in bytes, `None` if it overflows `usize`.
    pub fn arena_bytes(&self) -> Option<usize> {
        self.unit_number.checked_mul(self.unit_size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.unit_size == 0 {
            return Err(ConkitError::InvalidConfig(
                "pool.unit_size must be greater than zero".to_string(),
            ));
        }
        if self.arena_bytes().is_none() {
            return Err(ConkitError::InvalidConfig(format!(
                "pool arena of {} x {} bytes overflows usize",
                self.unit_number, self.unit_size
            )));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            unit_number: Self::default_unit_number(),
            unit_size: Self::default_unit_size(),
        }
    }
}

/// Logging configuration consumed by [`crate::logging::init`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Filter directive: "error", "warn", "info", "debug", "trace" or a full
    /// `EnvFilter` directive such as "conkit_core=debug". `RUST_LOG` wins.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Colorize output
    #[serde(default = "default_true")]
    pub ansi: bool,

    /// Print the event target (module path)
    #[serde(default)]
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            ansi: true,
            with_target: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl ConkitConfig {
    /// Load configuration from defaults, an optional TOML file and
    /// `CONKIT__*` environment variables, in that order of precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConkitError::ConfigNotFound(path.to_path_buf()));
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: ConkitConfig = settings.try_deserialize()?;
        cfg.validate()?;

        info!(
            unit_number = cfg.pool.unit_number,
            unit_size = cfg.pool.unit_size,
            "Loaded conkit configuration"
        );
        Ok(cfg)
    }

    /// Parse a TOML document. Missing sections and keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg: ConkitConfig = toml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.logging.level.trim().is_empty() {
            return Err(ConkitError::InvalidConfig(
                "logging.level must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_pool_is_fifty_units_of_one_kib() {
        let cfg = ConkitConfig::default();
        assert_eq!(cfg.pool.unit_number, 50);
        assert_eq!(cfg.pool.unit_size, 1024);
        assert_eq!(cfg.pool.arena_bytes(), Some(50 * 1024));
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() -> anyhow::Result<()> {
        let cfg = ConkitConfig::from_toml_str(
            r#"
            [pool]
            unit_size = 4096
            "#,
        )?;
        assert_eq!(cfg.pool.unit_size, 4096);
        assert_eq!(cfg.pool.unit_number, 50);
        assert_eq!(cfg.logging, LoggingConfig::default());
        Ok(())
    }

    #[test]
    fn zero_unit_size_is_rejected() {
        let err = ConkitConfig::from_toml_str("[pool]\nunit_size = 0\n").unwrap_err();
        assert!(matches!(err, ConkitError::InvalidConfig(_)));
    }

    #[test]
    fn overflowing_arena_is_rejected() {
        let cfg = PoolConfig {
            unit_number: usize::MAX,
            unit_size: 2,
        };
        assert!(matches!(cfg.validate(), Err(ConkitError::InvalidConfig(_))));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = ConkitConfig::from_toml_str("[pool\nunit_size = ").unwrap_err();
        assert!(matches!(err, ConkitError::TomlParse(_)));
    }

    #[test]
    fn load_reads_toml_file() -> anyhow::Result<()> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(
            file,
            "[pool]\nunit_number = 8\nunit_size = 256\n\n[logging]\nlevel = \"debug\"\nansi = false"
        )?;

        let cfg = ConkitConfig::load(Some(file.path()))?;
        assert_eq!(cfg.pool.unit_number, 8);
        assert_eq!(cfg.pool.unit_size, 256);
        assert_eq!(cfg.logging.level, "debug");
        assert!(!cfg.logging.ansi);
        Ok(())
    }

    #[test]
    fn load_missing_file_fails() {
        let err = ConkitConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConkitError::ConfigNotFound(_)));
    }
}
