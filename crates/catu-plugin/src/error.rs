//! Plugin system error types.
//!
//! `PluginError` is used inside the crate. The manager's public surface
//! narrows it to `LoadError` and `ExecError`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("host function error: {0}")]
    HostFunction(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

/// Failure of [`PluginManager::load_plugin`](crate::PluginManager::load_plugin).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The descriptor requested capabilities outside the recognized set.
    /// Carries the rejected names.
    #[error("permission denied: unrecognized capabilities [{}]", .0.join(", "))]
    PermissionDenied(Vec<String>),

    /// The source failed to evaluate, did not expose its entry points,
    /// or threw from `initialize`.
    #[error("script error: {0}")]
    ScriptError(String),
}

/// Failure of [`PluginManager::execute_plugin`](crate::PluginManager::execute_plugin)
/// and [`PluginManager::unregister_plugin`](crate::PluginManager::unregister_plugin).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}
