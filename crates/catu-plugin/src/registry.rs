//! Plugin registry: id → loaded plugin.
//!
//! Pure bookkeeping. The registry knows nothing about the interpreter and
//! never runs entry points; the manager decides when cleanup happens.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::descriptor::PluginDescriptor;
use crate::sandbox::NamespaceHandle;

// ─── Loaded plugin entry ────────────────────────────────────────────────

/// A plugin that passed validation, evaluated, and initialized.
#[derive(Debug, Clone)]
pub struct RegisteredPlugin {
    pub id: String,
    pub descriptor: Arc<PluginDescriptor>,
    pub handle: NamespaceHandle,
}

// ─── Registry ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, RegisteredPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns the entry previously stored under the id.
    pub async fn register(&self, plugin: RegisteredPlugin) -> Option<RegisteredPlugin> {
        let mut plugins = self.plugins.write().await;
        plugins.insert(plugin.id.clone(), plugin)
    }

    pub async fn lookup(&self, id: &str) -> Option<RegisteredPlugin> {
        self.plugins.read().await.get(id).cloned()
    }

    pub async fn unregister(&self, id: &str) -> Option<RegisteredPlugin> {
        self.plugins.write().await.remove(id)
    }

    /// Registered ids, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Registered entries, sorted by id.
    pub async fn entries(&self) -> Vec<RegisteredPlugin> {
        let mut entries: Vec<RegisteredPlugin> =
            self.plugins.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub async fn len(&self) -> usize {
        self.plugins.read().await.len()
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.plugins.read().await.contains_key(id)
    }
}
