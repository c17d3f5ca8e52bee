//! Error types for the plugin host.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Result type for plugin host operations.
pub type Result<T> = std::result::Result<T, PluginHostError>;

/// Plugin host error types.
#[derive(Debug, thiserror::Error)]
pub enum PluginHostError {
    /// A blank path or name was supplied.
    #[error("Argument must not be empty: {0}")]
    EmptyArgument(&'static str),

    /// No candidate file exists on any search path.
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// The file loads but exports no plugin types.
    #[error("Not a plugin module: {}", .0.display())]
    NotAPluginModule(PathBuf),

    /// The file is not a loadable dynamic library at all.
    #[error("Bad module format: {}: {reason}", path.display())]
    BadModuleFormat { path: PathBuf, reason: String },

    /// One exported type failed to resolve. Recovered locally: logged and excluded.
    #[error("Failed to load type {type_name}: {reason}")]
    TypeLoad { type_name: String, reason: String },

    /// No descriptor is known for the requested name.
    #[error("Plugin not found: {0}")]
    PlugInNotFound(String),

    /// The plugin exists but is not of the requested type.
    #[error("Plugin {name} is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    /// A directory to scan does not exist.
    #[error("Directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    /// The module was built against another SDK ABI.
    #[error("Plugin ABI version mismatch: expected {expected}, found {found}")]
    AbiMismatch { expected: u32, found: u32 },

    /// A plugin factory returned an error or panicked.
    #[error("Construction of {name} failed: {reason}")]
    ConstructionFailed { name: String, reason: String },

    /// The isolated probe could not produce a report.
    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    /// The isolated probe did not finish in time.
    #[error("Probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    /// The signing policy refused the module.
    #[error("Signature rejected for {}: {reason}", path.display())]
    SignatureRejected { path: PathBuf, reason: String },

    /// The module cache was disposed.
    #[error("Module cache has been disposed")]
    CacheDisposed,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PluginHostError {
    pub fn bad_format(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        PluginHostError::BadModuleFormat {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Stable variant name, used as the error kind on the probe wire format.
    pub fn kind(&self) -> &'static str {
        match self {
            PluginHostError::EmptyArgument(_) => "EmptyArgument",
            PluginHostError::ModuleNotFound(_) => "ModuleNotFound",
            PluginHostError::NotAPluginModule(_) => "NotAPluginModule",
            PluginHostError::BadModuleFormat { .. } => "BadModuleFormat",
            PluginHostError::TypeLoad { .. } => "TypeLoad",
            PluginHostError::PlugInNotFound(_) => "PlugInNotFound",
            PluginHostError::TypeMismatch { .. } => "TypeMismatch",
            PluginHostError::DirectoryNotFound(_) => "DirectoryNotFound",
            PluginHostError::AbiMismatch { .. } => "AbiMismatch",
            PluginHostError::ConstructionFailed { .. } => "ConstructionFailed",
            PluginHostError::ProbeFailed(_) => "ProbeFailed",
            PluginHostError::ProbeTimeout(_) => "ProbeTimeout",
            PluginHostError::SignatureRejected { .. } => "SignatureRejected",
            PluginHostError::CacheDisposed => "CacheDisposed",
            PluginHostError::Config(_) => "Config",
            PluginHostError::Io(_) => "Io",
            PluginHostError::Json(_) => "Json",
            PluginHostError::Toml(_) => "Toml",
        }
    }

    /// Whether a directory scan should skip the file quietly.
    pub fn is_not_a_plugin(&self) -> bool {
        matches!(
            self,
            PluginHostError::NotAPluginModule(_) | PluginHostError::BadModuleFormat { .. }
        )
    }
}

/// True for blank or whitespace-only paths and names.
pub(crate) fn is_blank(value: impl AsRef<std::ffi::OsStr>) -> bool {
    value.as_ref().to_string_lossy().trim().is_empty()
}
