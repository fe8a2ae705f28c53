//! Configuration loading and validation for promptloom.
//!
//! Loads configuration from `~/.promptloom/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.promptloom/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptloomConfig {
    /// Default token budget for a render
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Characters per token for the default estimator
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,

    /// Data sources templates may reference. `None` allows any name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_sources: Option<Vec<String>>,

    /// Reject templates referencing sources outside `allowed_sources`
    /// at compile time instead of rendering them as absent.
    #[serde(default)]
    pub strict_sources: bool,

    /// Directory relative template paths are resolved against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,
}

fn default_max_tokens() -> usize {
    4096
}
fn default_chars_per_token() -> f64 {
    4.0
}

impl Default for PromptloomConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            chars_per_token: default_chars_per_token(),
            allowed_sources: None,
            strict_sources: false,
            template_dir: None,
        }
    }
}

impl PromptloomConfig {
    /// Load configuration from the default path (~/.promptloom/config.toml).
    ///
    /// Environment overrides, applied after the file:
    /// - `PROMPTLOOM_MAX_TOKENS`
    /// - `PROMPTLOOM_CHARS_PER_TOKEN`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(raw) = var("PROMPTLOOM_MAX_TOKENS") {
            self.max_tokens = raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "PROMPTLOOM_MAX_TOKENS must be a non-negative integer, got '{raw}'"
                ))
            })?;
        }
        if let Some(raw) = var("PROMPTLOOM_CHARS_PER_TOKEN") {
            self.chars_per_token = raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "PROMPTLOOM_CHARS_PER_TOKEN must be a number, got '{raw}'"
                ))
            })?;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".promptloom")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.chars_per_token.is_finite() || self.chars_per_token <= 0.0 {
            return Err(ConfigError::ValidationError(
                "chars_per_token must be a positive number".into(),
            ));
        }

        if let Some(sources) = &self.allowed_sources
            && let Some(blank) = sources.iter().find(|s| s.trim().is_empty())
        {
            return Err(ConfigError::ValidationError(format!(
                "allowed_sources contains a blank name: '{blank}'"
            )));
        }

        if self.strict_sources && self.allowed_sources.is_none() {
            return Err(ConfigError::ValidationError(
                "strict_sources requires allowed_sources".into(),
            ));
        }

        Ok(())
    }

    /// Resolve a template path against `template_dir`.
    pub fn template_path(&self, path: &Path) -> PathBuf {
        match &self.template_dir {
            Some(dir) if path.is_relative() && !path.exists() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Sources to enforce at compile time, if strict.
    pub fn enforced_sources(&self) -> Option<&[String]> {
        if self.strict_sources {
            self.allowed_sources.as_deref()
        } else {
            None
        }
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for promptloom_core::Error {
    fn from(e: ConfigError) -> Self {
        promptloom_core::Error::Config {
            message: e.to_string(),
        }
    }
}
