//! Plugin descriptors and `plugin.toml` manifest parsing.
//!
//! A descriptor is the transient input to `load_plugin`. Callers can build
//! one directly or read it from a catalog directory where every plugin
//! lives in its own sub-directory:
//!
//! ```text
//! catalog/
//!   echo/
//!     plugin.toml
//!     main.js
//! ```

use std::collections::BTreeSet;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// Name of the manifest file inside a plugin directory.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Everything needed to load a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Stable identifier; also the namespace key.
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    /// Script body. Opaque to the manager.
    pub source: String,
    /// Requested capability names. Unknown names are kept so they can be
    /// rejected at load time.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl PluginDescriptor {
    /// Descriptor with empty metadata and no capabilities.
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: "0.0.0".to_string(),
            author: String::new(),
            description: String::new(),
            source: source.into(),
            capabilities: BTreeSet::new(),
        }
    }

    /// Add requested capabilities by name.
    pub fn with_capabilities<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(names.into_iter().map(Into::into));
        self
    }

    /// Read `plugin.toml` from `dir`, validate it and load the entry script.
    pub fn from_manifest_dir(dir: &Path) -> Result<Self, PluginError> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&manifest_path).map_err(|e| {
            PluginError::Manifest(format!("cannot read {}: {e}", manifest_path.display()))
        })?;
        let manifest = PluginManifest::parse_and_validate(&content)?;
        let source = std::fs::read_to_string(dir.join(&manifest.script.entry))?;
        Ok(manifest.into_descriptor(source))
    }
}

/// Manifest parsed from `plugin.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub plugin: PluginMeta,
    pub script: ScriptConfig,
}

/// `[plugin]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMeta {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// `[script]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    pub entry: String,
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Validate a plugin id against `^[a-z][a-z0-9_-]{1,63}$`.
pub(crate) fn validate_plugin_id(id: &str) -> Result<(), PluginError> {
    let len = id.len();
    if !(2..=64).contains(&len) {
        return Err(PluginError::InvalidManifest(format!(
            "plugin id must be 2-64 characters, got {len}"
        )));
    }

    let mut chars = id.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() {
            return Err(PluginError::InvalidManifest(format!(
                "plugin id must start with a lowercase letter, got '{first}'"
            )));
        }
    }

    for ch in chars {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' && ch != '_' {
            return Err(PluginError::InvalidManifest(format!(
                "plugin id contains invalid character '{ch}'"
            )));
        }
    }

    Ok(())
}

fn validate_semver(value: &str, field_name: &str) -> Result<(), PluginError> {
    semver::Version::parse(value).map_err(|_| {
        PluginError::InvalidManifest(format!("{field_name} is not valid semver: '{value}'"))
    })?;
    Ok(())
}

/// Validate that a path is relative and has no `..` components.
fn validate_path_safety(path: &str, field_name: &str) -> Result<(), PluginError> {
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(PluginError::InvalidManifest(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    for component in p.components() {
        if matches!(component, Component::ParentDir) {
            return Err(PluginError::InvalidManifest(format!(
                "{field_name} must not contain '..': '{path}'"
            )));
        }
    }
    Ok(())
}

impl PluginManifest {
    /// Parse a manifest from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, PluginError> {
        let manifest: PluginManifest = toml::from_str(toml_str)?;
        Ok(manifest)
    }

    /// Validate metadata and the script path.
    ///
    /// Capability names are left alone; `load_plugin` is the single
    /// place that accepts or rejects them.
    pub fn validate(&self) -> Result<(), PluginError> {
        validate_plugin_id(&self.plugin.id)?;

        let name_len = self.plugin.name.len();
        if name_len == 0 || name_len > 100 {
            return Err(PluginError::InvalidManifest(format!(
                "plugin.name must be 1-100 characters, got {name_len}"
            )));
        }

        validate_semver(&self.plugin.version, "plugin.version")?;

        let desc_len = self.plugin.description.len();
        if desc_len == 0 || desc_len > 500 {
            return Err(PluginError::InvalidManifest(format!(
                "plugin.description must be 1-500 characters, got {desc_len}"
            )));
        }

        if let Some(ref author) = self.plugin.author {
            let len = author.len();
            if len == 0 || len > 255 {
                return Err(PluginError::InvalidManifest(format!(
                    "plugin.author must be 1-255 characters, got {len}"
                )));
            }
        }

        validate_path_safety(&self.script.entry, "script.entry")?;
        if !self.script.entry.ends_with(".js") {
            return Err(PluginError::InvalidManifest(format!(
                "script.entry must end with '.js', got '{}'",
                self.script.entry
            )));
        }

        Ok(())
    }

    pub fn parse_and_validate(toml_str: &str) -> Result<Self, PluginError> {
        let manifest = Self::parse(toml_str)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Combine with the loaded script body.
    pub fn into_descriptor(self, source: String) -> PluginDescriptor {
        PluginDescriptor {
            id: self.plugin.id,
            name: self.plugin.name,
            version: self.plugin.version,
            author: self.plugin.author.unwrap_or_default(),
            description: self.plugin.description,
            source,
            capabilities: self.plugin.capabilities.into_iter().collect(),
        }
    }
}

/// Read every plugin directory under `catalog_dir`, sorted by directory
/// name.
///
/// A broken entry is logged and skipped so one bad plugin does not hide
/// the rest of the catalog.
pub fn scan_catalog(catalog_dir: &Path) -> Result<Vec<PluginDescriptor>, PluginError> {
    let mut dirs: Vec<_> = std::fs::read_dir(catalog_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.join(MANIFEST_FILE).is_file())
        .collect();
    dirs.sort();

    let mut descriptors = Vec::with_capacity(dirs.len());
    for dir in dirs {
        match PluginDescriptor::from_manifest_dir(&dir) {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(e) => {
                tracing::warn!(path = %dir.display(), "skipping plugin: {e}");
            }
        }
    }
    Ok(descriptors)
}

// ─── Tests ──────────────────────────────────────────────────────────
