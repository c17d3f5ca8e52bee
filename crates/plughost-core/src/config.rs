//! Host configuration.
//!
//! [`HostConfig`] is plain serde data, loadable from TOML and overridable from
//! the environment:
//!
//! ```toml
//! search_paths = ["/opt/app/plugins"]
//! populate_default_search_paths = false
//! file_pattern = "*.so"
//!
//! [probe]
//! mode = "process"
//! timeout_ms = 10000
//!
//! [signing]
//! mode = "require"
//! public_key = "3b6a27bc..."
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PluginHostError, Result};

/// Environment variables read by [`HostConfig::apply_env`].
pub mod env_vars {
    /// Extra search directories, separated like `PATH`.
    pub const PLUGIN_PATH: &str = "PLUGHOST_PLUGIN_PATH";
    pub const PROBE_RUNNER: &str = "PLUGHOST_PROBE_RUNNER";
    pub const PROBE_TIMEOUT_MS: &str = "PLUGHOST_PROBE_TIMEOUT_MS";
    /// `process` or `in-process`
    pub const PROBE_MODE: &str = "PLUGHOST_PROBE_MODE";
}

/// Defaults.
pub mod defaults {
    pub const PROBE_TIMEOUT_MS: u64 = 10_000;
}

/// How candidates are probed before loading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeMode {
    /// Separate runner process (falls back to in-process if no runner is found)
    #[default]
    Process,
    /// Load and discard inside the host
    InProcess,
}

impl std::str::FromStr for ProbeMode {
    type Err = PluginHostError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(ProbeMode::Process),
            "in-process" | "inprocess" | "in_process" => Ok(ProbeMode::InProcess),
            other => Err(PluginHostError::Config(format!("Unknown probe mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub mode: ProbeMode,
    /// Probe runner binary; located automatically when unset
    pub runner: Option<PathBuf>,
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            mode: ProbeMode::Process,
            runner: None,
            timeout_ms: defaults::PROBE_TIMEOUT_MS,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What to do with unsigned or mismatched modules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningMode {
    #[default]
    Ignore,
    Warn,
    Require,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningPolicy {
    pub mode: SigningMode,
    /// Hex encoded Ed25519 public key modules must be signed with
    pub public_key: Option<String>,
}

impl SigningPolicy {
    pub fn require(public_key: Option<&[u8]>) -> Self {
        Self {
            mode: SigningMode::Require,
            public_key: public_key.map(hex::encode),
        }
    }

    /// Decoded expected key.
    pub fn expected_key(&self) -> Result<Option<Vec<u8>>> {
        self.public_key
            .as_deref()
            .map(|key| {
                hex::decode(key.trim())
                    .map_err(|e| PluginHostError::Config(format!("Invalid signing public key: {}", e)))
            })
            .transpose()
    }
}

/// Configuration of a [`PluginHost`](crate::PluginHost).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub search_paths: Vec<PathBuf>,
    pub populate_default_search_paths: bool,
    /// Glob selecting candidates in directory scans
    pub file_pattern: Option<String>,
    pub probe: ProbeConfig,
    pub signing: SigningPolicy,
}

impl HostConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: HostConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `PLUGHOST_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(paths) = std::env::var_os(env_vars::PLUGIN_PATH) {
            self.search_paths.extend(
                std::env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()),
            );
        }

        if let Some(runner) = std::env::var_os(env_vars::PROBE_RUNNER) {
            if !runner.is_empty() {
                self.probe.runner = Some(PathBuf::from(runner));
            }
        }

        if let Ok(timeout) = std::env::var(env_vars::PROBE_TIMEOUT_MS) {
            self.probe.timeout_ms = timeout.trim().parse().map_err(|_| {
                PluginHostError::Config(format!(
                    "{} must be a number of milliseconds, got {:?}",
                    env_vars::PROBE_TIMEOUT_MS,
                    timeout
                ))
            })?;
        }

        if let Ok(mode) = std::env::var(env_vars::PROBE_MODE) {
            self.probe.mode = mode.parse()?;
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.probe.timeout_ms == 0 {
            return Err(PluginHostError::Config(
                "probe.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if let Some(pattern) = &self.file_pattern {
            glob::Pattern::new(pattern).map_err(|e| {
                PluginHostError::Config(format!("Invalid file pattern {}: {}", pattern, e))
            })?;
        }
        self.signing.expected_key()?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PluginHostError::Config(e.to_string()))
    }
}
