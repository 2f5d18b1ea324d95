//! Configuration file loading for Arbiter
//!
//! Handles loading and parsing configuration files using the config crate.
//! Environment variables prefixed with `ARBITER_` are layered on top, with
//! `__` separating nested keys (`ARBITER_JUDGE__FAIL_FAST=true`).

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::config::{Config, ConfigError, ENV_PREFIX, EXAMPLE_CONFIG};

impl Config {
    /// Load configuration from a file, or the embedded defaults when `path` is
    /// `None`, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let builder = match path {
            Some(path) => ConfigBuilder::builder().add_source(File::from(path)),
            None => ConfigBuilder::builder()
                .add_source(File::from_str(EXAMPLE_CONFIG, FileFormat::Toml)),
        };

        let config = builder.add_source(env_source()).build()?;
        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        for (id, lang) in &self.languages {
            if lang.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty name"
                )));
            }
            if lang.extension.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty extension"
                )));
            }
            if lang.run.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty run command"
                )));
            }
            if let Some(ref compile) = lang.compile {
                if compile.command.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "language '{id}' has empty compile command"
                    )));
                }
                if compile.timeout_ms == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "language '{id}' has zero compile timeout"
                    )));
                }
            }
        }

        if self.judge.safety_factor == 0 {
            return Err(ConfigError::Invalid(
                "judge.safety_factor must be at least 1".to_string(),
            ));
        }
        if self.judge.report_output_bytes == 0 {
            return Err(ConfigError::Invalid(
                "judge.report_output_bytes must be positive".to_string(),
            ));
        }
        if self.sandbox.memory_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.memory_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.scratch_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("scratch_root is empty".to_string()));
        }
        if let Some(path) = self.sandbox.readonly_paths.iter().find(|p| !p.is_absolute()) {
            return Err(ConfigError::Invalid(format!(
                "sandbox.readonly_paths entry '{}' is not absolute",
                path.display()
            )));
        }

        Ok(())
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
