//! Plugin type error types.

/// Failure to resolve or construct one exported plugin type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeLoadError {
    /// A library, file or service the type needs is not available.
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// The constructor refused to build an instance.
    #[error("Construction failed: {0}")]
    ConstructionFailed(String),

    /// Custom error
    #[error("{0}")]
    Other(String),
}

impl TypeLoadError {
    pub fn missing_dependency(what: impl Into<String>) -> Self {
        TypeLoadError::MissingDependency(what.into())
    }

    pub fn construction(reason: impl Into<String>) -> Self {
        TypeLoadError::ConstructionFailed(reason.into())
    }
}
