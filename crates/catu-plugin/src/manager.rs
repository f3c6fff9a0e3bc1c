//! Plugin manager: the public entry point of the plugin system.
//!
//! Loading runs validate → evaluate → retire old → initialize → register. Executing runs
//! lookup → invoke. Every failure is reported per call; a broken plugin
//! never takes the interpreter or its neighbours down with it.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::capability;
use crate::descriptor::{scan_catalog, validate_plugin_id, PluginDescriptor};
use crate::error::{ExecError, LoadError, PluginError};
use crate::host::{HostConfig, LogNotifier, Notifier};
use crate::registry::{PluginRegistry, RegisteredPlugin};
use crate::sandbox::{DefineRequest, SandboxConfig, ScriptContext};

// ─── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PluginConfig {
    pub sandbox: SandboxConfig,
    pub host: HostConfig,
}

impl PluginConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            sandbox: SandboxConfig::from_env(),
            host: HostConfig::from_env(),
        }
    }
}

/// Strip the internal prefix from script failures so callers see the
/// interpreter's own message.
fn failure_message(err: PluginError) -> String {
    match err {
        PluginError::Script(msg) => msg,
        other => other.to_string(),
    }
}

// ─── Manager ────────────────────────────────────────────────────────────

pub struct PluginManager {
    registry: PluginRegistry,
    context: ScriptContext,
    /// Serializes load, unregister and shutdown across all ids.
    lifecycle: Mutex<()>,
}

impl PluginManager {
    /// Start a manager whose `host.notifyUser` goes to the log.
    pub fn new(config: PluginConfig) -> Result<Self, PluginError> {
        Self::with_notifier(config, Arc::new(LogNotifier))
    }

    pub fn with_notifier(
        config: PluginConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, PluginError> {
        let context = ScriptContext::spawn(config.sandbox, config.host, notifier)?;
        Ok(Self {
            registry: PluginRegistry::new(),
            context,
            lifecycle: Mutex::new(()),
        })
    }

    /// Validate, evaluate and initialize a plugin, then make it callable.
    ///
    /// Loading an id that is already loaded replaces it. The new body is
    /// evaluated first; if that fails the old version stays loaded.
    /// Otherwise the old version's `cleanup` runs, then the new
    /// `initialize`. If that `initialize` throws, the id ends up unloaded.
    pub async fn load_plugin(&self, descriptor: PluginDescriptor) -> Result<(), LoadError> {
        validate_plugin_id(&descriptor.id).map_err(|e| {
            let reason = match e {
                PluginError::InvalidManifest(msg) => msg,
                other => other.to_string(),
            };
            tracing::warn!(plugin = ?descriptor.id, "rejected plugin id: {reason}");
            LoadError::ScriptError(format!("invalid plugin id {:?}: {reason}", descriptor.id))
        })?;

        let capabilities = capability::grant(&descriptor.capabilities).map_err(|rejected| {
            tracing::warn!(
                plugin = %descriptor.id,
                rejected = ?rejected,
                "plugin requested unrecognized capabilities"
            );
            LoadError::PermissionDenied(rejected)
        })?;

        let _guard = self.lifecycle.lock().await;
        let start = Instant::now();

        let handle = self
            .context
            .evaluate(DefineRequest {
                plugin_id: descriptor.id.clone(),
                name: descriptor.name.clone(),
                version: descriptor.version.clone(),
                source: descriptor.source.clone(),
                capabilities: capabilities.clone(),
            })
            .await
            .map_err(|e| {
                let message = failure_message(e);
                tracing::warn!(plugin = %descriptor.id, "plugin failed to load: {message}");
                LoadError::ScriptError(message)
            })?;

        // The old version's cleanup runs before the new version's
        // initialize; both share the plugin's data directory.
        let previous = self.registry.lookup(&descriptor.id).await;
        if let Some(previous) = &previous {
            if let Err(e) = self.context.retire(&previous.handle).await {
                tracing::warn!(
                    plugin = %descriptor.id,
                    generation = previous.handle.generation(),
                    "cleanup of previous version failed: {}",
                    failure_message(e)
                );
            }
        }

        if let Err(e) = self.context.initialize(&handle).await {
            let message = failure_message(e);
            if previous.is_some() {
                self.registry.unregister(&descriptor.id).await;
                tracing::warn!(
                    plugin = %descriptor.id,
                    "reload failed in initialize, plugin unloaded: {message}"
                );
            } else {
                tracing::warn!(plugin = %descriptor.id, "plugin failed to load: {message}");
            }
            return Err(LoadError::ScriptError(message));
        }

        tracing::info!(
            plugin = %descriptor.id,
            version = %descriptor.version,
            generation = handle.generation(),
            capabilities = ?capabilities,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "{}",
            if previous.is_some() { "plugin reloaded" } else { "plugin loaded" }
        );

        self.registry
            .register(RegisteredPlugin {
                id: descriptor.id.clone(),
                descriptor: Arc::new(descriptor),
                handle,
            })
            .await;

        Ok(())
    }

    /// Run a loaded plugin's `execute` entry point on `input`.
    pub async fn execute_plugin(
        &self,
        id: &str,
        input: Map<String, Value>,
    ) -> Result<Value, ExecError> {
        let input = Value::Object(input);

        let plugin = self
            .registry
            .lookup(id)
            .await
            .ok_or_else(|| ExecError::PluginNotFound(id.to_string()))?;

        match self.context.invoke(&plugin.handle, input.clone()).await {
            Ok(value) => Ok(value),
            Err(PluginError::NotFound(_)) => {
                // Retired by a reload or unregister after the lookup. Retry
                // once with lifecycle changes held off.
                let _guard = self.lifecycle.lock().await;
                let plugin = self
                    .registry
                    .lookup(id)
                    .await
                    .ok_or_else(|| ExecError::PluginNotFound(id.to_string()))?;
                self.context
                    .invoke(&plugin.handle, input)
                    .await
                    .map_err(|e| execution_failure(id, e))
            }
            Err(e) => Err(execution_failure(id, e)),
        }
    }

    /// Run `cleanup` and remove the plugin.
    ///
    /// The plugin is removed even when `cleanup` throws; the throw is
    /// reported as `ExecutionFailed`.
    pub async fn unregister_plugin(&self, id: &str) -> Result<(), ExecError> {
        let _guard = self.lifecycle.lock().await;

        let plugin = self
            .registry
            .unregister(id)
            .await
            .ok_or_else(|| ExecError::PluginNotFound(id.to_string()))?;

        match self.context.retire(&plugin.handle).await {
            Ok(()) => {
                tracing::info!(plugin = %id, "plugin unloaded");
                Ok(())
            }
            Err(e) => {
                let message = failure_message(e);
                tracing::warn!(plugin = %id, "plugin unloaded, cleanup failed: {message}");
                Err(ExecError::ExecutionFailed(message))
            }
        }
    }

    /// Load every plugin found in a catalog directory.
    ///
    /// Returns how many loaded. Entries that fail to parse or load are
    /// logged and skipped.
    pub async fn load_catalog(&self, catalog_dir: &Path) -> Result<usize, PluginError> {
        let descriptors = scan_catalog(catalog_dir)?;
        let total = descriptors.len();
        let mut loaded = 0;

        for descriptor in descriptors {
            let id = descriptor.id.clone();
            match self.load_plugin(descriptor).await {
                Ok(()) => loaded += 1,
                Err(e) => tracing::warn!(plugin = %id, "skipping catalog entry: {e}"),
            }
        }

        tracing::info!(
            catalog = %catalog_dir.display(),
            loaded,
            skipped = total - loaded,
            "plugin catalog loaded"
        );
        Ok(loaded)
    }

    /// Descriptors of loaded plugins, sorted by id.
    pub async fn loaded_plugins(&self) -> Vec<Arc<PluginDescriptor>> {
        self.registry
            .entries()
            .await
            .into_iter()
            .map(|entry| entry.descriptor)
            .collect()
    }

    pub async fn descriptor(&self, id: &str) -> Option<Arc<PluginDescriptor>> {
        self.registry.lookup(id).await.map(|entry| entry.descriptor)
    }

    pub async fn is_loaded(&self, id: &str) -> bool {
        self.registry.is_registered(id).await
    }

    pub async fn loaded_count(&self) -> usize {
        self.registry.len().await
    }

    /// Clean up every plugin in id order and stop the interpreter.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;

        for id in self.registry.ids().await {
            let Some(plugin) = self.registry.unregister(&id).await else {
                continue;
            };
            if let Err(e) = self.context.retire(&plugin.handle).await {
                tracing::warn!(plugin = %id, "cleanup failed during shutdown: {}", failure_message(e));
            }
        }

        self.context.shutdown().await;
        tracing::info!("plugin manager shut down");
    }
}

fn execution_failure(id: &str, err: PluginError) -> ExecError {
    match err {
        PluginError::NotFound(_) => ExecError::PluginNotFound(id.to_string()),
        other => {
            let message = failure_message(other);
            tracing::error!(plugin = %id, "plugin execution failed: {message}");
            ExecError::ExecutionFailed(message)
        }
    }
}
