//! Configuration file support
//!
//! Loads settings from `~/.tm-highlight.toml` (or `%USERPROFILE%\.tm-highlight.toml`
//! on Windows). Every key is optional.
//!
//! Example:
//! ```text
//! [tokenizer]
//! time_budget_ms = 500
//! max_line_length = 10000
//!
//! [scheduler]
//! thread_name = "tokenizer"
//!
//! [theme]
//! path = "themes/dark.css"
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Configuration settings
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub tokenizer: TokenizerConfig,
    pub scheduler: SchedulerConfig,
    pub theme: ThemeConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenizerConfig {
    /// Regex work allowed per line in milliseconds, 0 disables the limit
    pub time_budget_ms: u64,
    /// Lines longer than this (in bytes) are not tokenized
    pub max_line_length: usize,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            time_budget_ms: 1000,
            max_line_length: 20_000,
        }
    }
}

impl TokenizerConfig {
    pub fn time_budget(&self) -> Option<Duration> {
        budget(self.time_budget_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Name given to background tokenizer threads
    pub thread_name: String,
    /// Per line budget used by the background worker, falls back to the tokenizer budget
    pub line_time_budget_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_name: "tm-tokenizer".to_string(),
            line_time_budget_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThemeConfig {
    /// Theme applied when none is given on the command line
    pub path: Option<PathBuf>,
}

fn budget(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Config {
    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        #[cfg(windows)]
        {
            std::env::var("USERPROFILE")
                .ok()
                .map(|home| PathBuf::from(home).join(".tm-highlight.toml"))
        }

        #[cfg(not(windows))]
        {
            std::env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(".tm-highlight.toml"))
        }
    }

    /// Load the default config file, falling back to defaults when it does not exist
    pub fn load() -> Result<Self, ConfigError> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Parse config file contents
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Budget the background worker gives each line
    pub fn line_time_budget(&self) -> Option<Duration> {
        match self.scheduler.line_time_budget_ms {
            Some(ms) => budget(ms),
            None => self.tokenizer.time_budget(),
        }
    }
}
