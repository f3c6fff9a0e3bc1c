// Shared test utilities for integration tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use catu_plugin::{HostConfig, Notifier, PluginConfig, PluginManager, SandboxConfig};
use serde_json::{Map, Value};
use tempfile::TempDir;

/// Captures `host.notifyUser` calls as `(plugin_id, message)`.
#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages().into_iter().map(|(_, m)| m).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, plugin_id: &str, message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((plugin_id.to_string(), message.to_string()));
    }
}

/// A manager wired to temporary asset/data dirs and a recording notifier.
pub struct TestHost {
    pub manager: Arc<PluginManager>,
    pub notifier: Arc<RecordingNotifier>,
    pub assets: TempDir,
    pub data: TempDir,
}

pub fn test_host() -> TestHost {
    test_host_with(|_| {})
}

pub fn test_host_with(tweak: impl FnOnce(&mut PluginConfig)) -> TestHost {
    let assets = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let mut config = PluginConfig {
        sandbox: SandboxConfig {
            execution_timeout: Some(Duration::from_millis(500)),
            ..SandboxConfig::default()
        },
        host: HostConfig {
            assets_dir: assets.path().to_path_buf(),
            data_dir: data.path().to_path_buf(),
            ..HostConfig::default()
        },
    };
    tweak(&mut config);

    let notifier = Arc::new(RecordingNotifier::default());
    let manager = PluginManager::with_notifier(config, notifier.clone()).unwrap();
    TestHost {
        manager: Arc::new(manager),
        notifier,
        assets,
        data,
    }
}

/// Source with the three entry points; `execute` runs `body`.
pub fn plugin_source(body: &str) -> String {
    format!("function initialize(){{}} function execute(input){{ {body} }} function cleanup(){{}}")
}

pub fn input(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("test input must be an object, got {other}"),
    }
}
