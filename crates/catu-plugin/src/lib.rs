//! Catu Plugin System
//!
//! Script plugin runtime built on an embedded QuickJS interpreter. Each
//! plugin is a JavaScript body defining `initialize`, `execute` and
//! `cleanup`; it is evaluated into its own namespace inside one shared
//! interpreter and talks to the host only through a capability-gated
//! `host` object (`readFile`, `writeFile`, `fetch`, `log`, `notifyUser`).
//!
//! [`PluginManager`] is the entry point: it validates capabilities, loads
//! and reloads plugins, executes them with per-call fault isolation, and
//! runs their cleanup on unregister.

pub mod capability;
pub mod descriptor;
pub mod error;
pub mod host;
pub mod manager;
pub mod registry;
pub mod sandbox;

pub use capability::{Capability, CapabilitySet, KNOWN_CAPABILITIES};
pub use descriptor::{scan_catalog, PluginDescriptor, PluginManifest};
pub use error::{ExecError, LoadError, PluginError};
pub use host::{HostConfig, LogNotifier, Notifier};
pub use manager::{PluginConfig, PluginManager};
pub use registry::{PluginRegistry, RegisteredPlugin};
pub use sandbox::{NamespaceHandle, SandboxConfig, ScriptContext};
