//! Kernel configuration.
//!
//! A plain `key=value` file format: comments with `#`, quoted values, one
//! setting per line. Precedence is explicit overrides > config file >
//! built-in defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Kernel-wide configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Discovery directory for agent contract files, read by the Contract
    /// Parser and Agent Registry.
    pub contracts_dir: PathBuf,
    /// Root of the Registry Store's on-disk layout.
    pub registry_root: PathBuf,
    /// Root of the State Manager's on-disk layout.
    pub state_root: PathBuf,
    /// Root of the Audit Sink's on-disk layout.
    pub audit_root: PathBuf,

    /// Extra fingerprint ignore-list entries, layered on top of the fixed
    /// defaults.
    pub fingerprint_ignore: Vec<String>,

    /// Per-agent live-call timeout in seconds.
    pub live_timeout_sec: u64,
    /// Maximum live-call attempts before `provider_transient_exhausted`.
    pub retry_max_attempts: u32,
    /// Base backoff in milliseconds for the exponential retry schedule,
    /// starting small and doubling on each attempt.
    pub retry_base_backoff_ms: u64,

    /// Whether prechecks enforce that declared-required input fields be
    /// non-empty (not just present). Defaults to strict; exists so test
    /// fixtures can relax it.
    pub precheck_require_nonempty: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            contracts_dir: PathBuf::from("contracts"),
            registry_root: PathBuf::from("var/registry"),
            state_root: PathBuf::from("var/state"),
            audit_root: PathBuf::from("var/audit"),
            fingerprint_ignore: Vec::new(),
            live_timeout_sec: 300,
            retry_max_attempts: 3,
            retry_base_backoff_ms: 2000,
            precheck_require_nonempty: true,
        }
    }
}

impl KernelConfig {
    /// Load a config from a file, merging onto defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "contracts_dir" => self.contracts_dir = PathBuf::from(value),
            "registry_root" => self.registry_root = PathBuf::from(value),
            "state_root" => self.state_root = PathBuf::from(value),
            "audit_root" => self.audit_root = PathBuf::from(value),
            "fingerprint_ignore" => {
                self.fingerprint_ignore = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "live_timeout_sec" => self.live_timeout_sec = Self::parse_u64(key, value)?,
            "retry_max_attempts" => {
                self.retry_max_attempts =
                    Self::parse_u64(key, value)?.min(u64::from(u32::MAX)) as u32;
            }
            "retry_base_backoff_ms" => self.retry_base_backoff_ms = Self::parse_u64(key, value)?,
            "precheck_require_nonempty" => {
                self.precheck_require_nonempty = Self::parse_bool(key, value)?;
            }
            _ => {
                // Unknown keys are logged and ignored, never fatal.
                eprintln!("warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative roots against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        for dir in [
            &mut self.contracts_dir,
            &mut self.registry_root,
            &mut self.state_root,
            &mut self.audit_root,
        ] {
            if dir.is_relative() {
                *dir = base.join(&dir);
            }
        }
    }
}
