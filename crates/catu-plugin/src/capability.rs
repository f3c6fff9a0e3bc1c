//! Capabilities a plugin may request, and the load-time validator.
//!
//! The set is closed: anything outside [`KNOWN_CAPABILITIES`] makes the
//! whole request fail. There is no partial grant.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::PluginError;

/// Capability names recognized by the host.
pub const KNOWN_CAPABILITIES: &[&str] = &["file_read", "file_write", "network", "ui"];

/// A named permission gating one host operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// `host.readFile`
    FileRead,
    /// `host.writeFile`
    FileWrite,
    /// `host.fetch`
    Network,
    /// `host.notifyUser`
    Ui,
}

/// Capabilities granted to one plugin.
pub type CapabilitySet = BTreeSet<Capability>;

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::FileRead,
        Capability::FileWrite,
        Capability::Network,
        Capability::Ui,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::FileRead => "file_read",
            Capability::FileWrite => "file_write",
            Capability::Network => "network",
            Capability::Ui => "ui",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| PluginError::PermissionDenied(format!("unknown capability '{s}'")))
    }
}

/// Check a requested capability set against the recognized names.
///
/// An empty request is always valid.
pub fn validate(requested: &BTreeSet<String>) -> bool {
    requested
        .iter()
        .all(|name| KNOWN_CAPABILITIES.contains(&name.as_str()))
}

/// Convert a request into a grant, all or nothing.
///
/// On failure returns every unrecognized name, sorted.
pub fn grant(requested: &BTreeSet<String>) -> Result<CapabilitySet, Vec<String>> {
    let mut granted = CapabilitySet::new();
    let mut rejected = Vec::new();

    for name in requested {
        match name.parse::<Capability>() {
            Ok(cap) => {
                granted.insert(cap);
            }
            Err(_) => rejected.push(name.clone()),
        }
    }

    if rejected.is_empty() {
        Ok(granted)
    } else {
        Err(rejected)
    }
}
