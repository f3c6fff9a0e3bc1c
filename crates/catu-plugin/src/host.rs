//! Host operations exposed to plugin scripts.
//!
//! `HostServices` owns the shared resources (asset and data roots, the HTTP
//! client, the notifier). `HostContext` binds them to one plugin and checks
//! that plugin's granted capabilities on every call.
//!
//! Low-level faults are converted here into the lenient contracts scripts
//! rely on: `write_file` reports `false`, `fetch` returns a failure string.
//! Only a missing capability is reported as an error from those two.

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::capability::{Capability, CapabilitySet};
use crate::error::PluginError;

/// Maximum log message length from plugins.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Tracing target for script-originated log lines.
pub const SCRIPT_LOG_TARGET: &str = "catu_plugin::script";

/// Sanitize a log message from a plugin.
///
/// Strips control characters (except newline/tab), truncates to max length.
fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for host operations.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Read-only asset area served by `readFile`.
    pub assets_dir: PathBuf,
    /// Writable area; each plugin writes under `<data_dir>/<plugin id>/`.
    pub data_dir: PathBuf,
    /// HTTP request timeout in seconds (default: 10).
    pub http_timeout_secs: u64,
    /// Maximum HTTP response body size (default: 10 MB).
    pub max_response_bytes: usize,
    /// Allow `fetch` to reach loopback, private and link-local hosts.
    pub allow_private_network: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            assets_dir: PathBuf::from("./data/plugin-assets"),
            data_dir: PathBuf::from("./data/plugin-data"),
            http_timeout_secs: 10,
            max_response_bytes: 10 * 1024 * 1024,
            allow_private_network: false,
        }
    }
}

impl HostConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            assets_dir: std::env::var("PLUGIN_ASSETS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.assets_dir),
            data_dir: std::env::var("PLUGIN_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            http_timeout_secs: std::env::var("PLUGIN_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            max_response_bytes: std::env::var("PLUGIN_MAX_RESPONSE_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .and_then(|mb| mb.checked_mul(1024 * 1024))
                .unwrap_or(defaults.max_response_bytes),
            allow_private_network: std::env::var("PLUGIN_ALLOW_PRIVATE_NETWORK")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }
}

// ─── Notifications ──────────────────────────────────────────────────────

/// User-visible notification surface.
pub trait Notifier: Send + Sync {
    fn notify(&self, plugin_id: &str, message: &str);
}

/// Notifier that only records the notification in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, plugin_id: &str, message: &str) {
        tracing::info!(plugin = %plugin_id, "notification: {message}");
    }
}

// ─── Shared services ────────────────────────────────────────────────────

/// Resources shared by every plugin's host context.
pub struct HostServices {
    config: HostConfig,
    /// Shared HTTP client for connection pooling.
    http_client: reqwest::blocking::Client,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HostServices {
    /// Build the shared services.
    ///
    /// Creates a blocking HTTP client, so this must not run on an async
    /// executor thread.
    pub fn new(config: HostConfig, notifier: Arc<dyn Notifier>) -> Result<Self, PluginError> {
        let http_client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| PluginError::HostFunction(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            config,
            http_client,
            notifier,
        })
    }
}

// ─── Host context ───────────────────────────────────────────────────────

/// Host operations on behalf of one plugin.
#[derive(Clone)]
pub struct HostContext {
    services: Arc<HostServices>,
    plugin_id: String,
    capabilities: CapabilitySet,
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("plugin_id", &self.plugin_id)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl HostContext {
    pub fn new(services: Arc<HostServices>, plugin_id: String, capabilities: CapabilitySet) -> Self {
        Self {
            services,
            plugin_id,
            capabilities,
        }
    }

    fn require(&self, capability: Capability) -> Result<(), PluginError> {
        if self.capabilities.contains(&capability) {
            Ok(())
        } else {
            Err(PluginError::PermissionDenied(format!(
                "plugin '{}' lacks capability '{capability}'",
                self.plugin_id
            )))
        }
    }

    // ── Files ────────────────────────────────────────────────────────

    /// Read a text file from the asset area. Requires `file_read`.
    pub fn read_file(&self, path: &str) -> Result<String, PluginError> {
        self.require(Capability::FileRead)?;

        let base = &self.services.config.assets_dir;
        let full = resolve_within(base, path)?;
        let canonical = full.canonicalize()?;
        if !canonical.starts_with(base.canonicalize()?) {
            return Err(PluginError::HostFunction(format!(
                "path escapes the asset directory: '{path}'"
            )));
        }
        Ok(std::fs::read_to_string(&canonical)?)
    }

    /// Write a text file into this plugin's data directory. Requires
    /// `file_write`.
    ///
    /// Returns `Ok(false)` when the write itself fails.
    pub fn write_file(&self, path: &str, content: &str) -> Result<bool, PluginError> {
        self.require(Capability::FileWrite)?;

        match self.try_write(path, content) {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::debug!(plugin = %self.plugin_id, path = %path, "plugin write failed: {e}");
                Ok(false)
            }
        }
    }

    /// Directory this plugin writes into.
    pub fn data_dir(&self) -> PathBuf {
        self.services.config.data_dir.join(&self.plugin_id)
    }

    fn try_write(&self, path: &str, content: &str) -> Result<(), PluginError> {
        let mut components = Path::new(&self.plugin_id).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(PluginError::HostFunction(format!(
                "plugin id '{}' is not a valid directory name",
                self.plugin_id
            )));
        }

        let base = self.data_dir();
        let full = resolve_within(&base, path)?;
        let parent = full
            .parent()
            .ok_or_else(|| PluginError::HostFunction(format!("invalid path: '{path}'")))?;
        std::fs::create_dir_all(parent)?;
        if !parent.canonicalize()?.starts_with(base.canonicalize()?) {
            return Err(PluginError::HostFunction(format!(
                "path escapes the data directory: '{path}'"
            )));
        }
        std::fs::write(&full, content)?;
        Ok(())
    }

    // ── Network ──────────────────────────────────────────────────────

    /// GET a URL and return the body as text. Requires `network`.
    ///
    /// Any failure after the capability check comes back as
    /// `Ok("request failed: ...")`.
    pub fn fetch(&self, url: &str) -> Result<String, PluginError> {
        self.require(Capability::Network)?;

        Ok(match self.try_fetch(url) {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(plugin = %self.plugin_id, url = %url, "plugin fetch failed: {e}");
                format!("request failed: {e}")
            }
        })
    }

    fn try_fetch(&self, url_str: &str) -> Result<String, PluginError> {
        let url = url::Url::parse(url_str)
            .map_err(|_| PluginError::HostFunction(format!("invalid URL: {url_str}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(PluginError::HostFunction(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }

        if !self.services.config.allow_private_network {
            check_private_host(&url)?;
        }

        let response = self
            .services
            .http_client
            .get(url)
            .send()
            .map_err(|e| PluginError::HostFunction(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PluginError::HostFunction(format!("HTTP {}", status.as_u16())));
        }

        let max = self.services.config.max_response_bytes;
        let mut body = Vec::new();
        response.take(max as u64 + 1).read_to_end(&mut body)?;
        if body.len() > max {
            return Err(PluginError::HostFunction(format!(
                "response body exceeds {max} bytes"
            )));
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    // ── Logging / UI ─────────────────────────────────────────────────

    /// Emit a diagnostic line. Never fails and needs no capability.
    pub fn log(&self, level: &str, message: &str) {
        let msg = sanitize_log_message(message);
        let plugin = self.plugin_id.as_str();
        match level.to_ascii_lowercase().as_str() {
            "error" => tracing::error!(target: SCRIPT_LOG_TARGET, plugin = %plugin, "{msg}"),
            "warn" | "warning" => tracing::warn!(target: SCRIPT_LOG_TARGET, plugin = %plugin, "{msg}"),
            "debug" => tracing::debug!(target: SCRIPT_LOG_TARGET, plugin = %plugin, "{msg}"),
            "trace" => tracing::trace!(target: SCRIPT_LOG_TARGET, plugin = %plugin, "{msg}"),
            _ => tracing::info!(target: SCRIPT_LOG_TARGET, plugin = %plugin, "{msg}"),
        }
    }

    /// Show a notification to the user. Requires `ui`.
    pub fn notify_user(&self, message: &str) -> Result<(), PluginError> {
        self.require(Capability::Ui)?;
        self.services
            .notifier
            .notify(&self.plugin_id, &sanitize_log_message(message));
        Ok(())
    }
}

// ─── Path and address checks ────────────────────────────────────────────

/// Join `path` onto `base`, rejecting absolute paths and `..` components.
fn resolve_within(base: &Path, path: &str) -> Result<PathBuf, PluginError> {
    if path.is_empty() {
        return Err(PluginError::HostFunction("path must not be empty".into()));
    }
    let p = Path::new(path);
    for component in p.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(PluginError::HostFunction(format!(
                    "path must not contain '..': '{path}'"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PluginError::HostFunction(format!(
                    "path must be relative: '{path}'"
                )));
            }
        }
    }
    Ok(base.join(p))
}

/// SECURITY: Block requests to private/reserved addresses.
fn check_private_host(url: &url::Url) -> Result<(), PluginError> {
    let ip: IpAddr = match url.host() {
        Some(url::Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            let blocked = ["localhost", "metadata.google.internal"];
            if blocked.contains(&domain.as_str()) || domain.ends_with(".localhost") {
                return Err(PluginError::PermissionDenied(format!(
                    "requests to '{domain}' are blocked (private/reserved address)"
                )));
            }
            return Ok(());
        }
        Some(url::Host::Ipv4(v4)) => IpAddr::V4(v4),
        Some(url::Host::Ipv6(v6)) => IpAddr::V6(v6),
        None => return Err(PluginError::HostFunction("URL has no host".into())),
    };

    if is_private_ip(ip) {
        return Err(PluginError::PermissionDenied(format!(
            "requests to private IP '{ip}' are blocked"
        )));
    }
    Ok(())
}

fn is_private_ipv4(v4: Ipv4Addr) -> bool {
    v4.is_private()
        || v4.is_loopback()
        || v4.is_link_local()
        || v4.is_unspecified()
        || v4.is_broadcast()
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ipv4(v4);
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (first & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (first & 0xffc0) == 0xfe80
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, plugin_id: &str, message: &str) {
            self.seen
                .lock()
                .unwrap()
                .push((plugin_id.to_string(), message.to_string()));
        }
    }

    struct Fixture {
        _assets: tempfile::TempDir,
        _data: tempfile::TempDir,
        services: Arc<HostServices>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture() -> Fixture {
        let assets = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        std::fs::write(assets.path().join("greeting.txt"), "hello from assets").unwrap();
        std::fs::create_dir(assets.path().join("lyrics")).unwrap();
        std::fs::write(assets.path().join("lyrics/song.lrc"), "[00:01]la la").unwrap();

        let config = HostConfig {
            assets_dir: assets.path().to_path_buf(),
            data_dir: data.path().to_path_buf(),
            ..HostConfig::default()
        };
        let notifier = Arc::new(RecordingNotifier::default());
        let services = Arc::new(HostServices::new(config, notifier.clone()).unwrap());
        Fixture {
            _assets: assets,
            _data: data,
            services,
            notifier,
        }
    }

    fn context(fx: &Fixture, caps: &[Capability]) -> HostContext {
        HostContext::new(
            fx.services.clone(),
            "test-plugin".to_string(),
            caps.iter().copied().collect(),
        )
    }

    // ─── sanitize_log_message ───────────────────────────────────────

    #[test]
    fn test_sanitize_log_message_strips_control_chars() {
        assert_eq!(sanitize_log_message("hello\r\nworld"), "hello\nworld");
        assert_eq!(sanitize_log_message("alert\x07!"), "alert!");
        assert_eq!(sanitize_log_message("\x1b[31mred\x1b[0m"), "[31mred[0m");
    }

    #[test]
    fn test_sanitize_log_message_truncates() {
        let exact = "x".repeat(MAX_LOG_MESSAGE_LEN);
        assert_eq!(sanitize_log_message(&exact).len(), MAX_LOG_MESSAGE_LEN);

        let long = "x".repeat(MAX_LOG_MESSAGE_LEN + 1);
        assert!(sanitize_log_message(&long).ends_with("… (truncated)"));
    }

    // ─── Config ─────────────────────────────────────────────────────

    #[test]
    fn test_host_config_default() {
        let config = HostConfig::default();
        assert_eq!(config.http_timeout_secs, 10);
        assert_eq!(config.max_response_bytes, 10 * 1024 * 1024);
        assert!(!config.allow_private_network);
    }

    #[test]
    fn test_host_config_from_env_response_limit() {
        std::env::set_var("PLUGIN_MAX_RESPONSE_MB", "2");
        assert_eq!(HostConfig::from_env().max_response_bytes, 2 * 1024 * 1024);

        std::env::set_var("PLUGIN_MAX_RESPONSE_MB", usize::MAX.to_string());
        assert_eq!(HostConfig::from_env().max_response_bytes, 10 * 1024 * 1024);

        std::env::remove_var("PLUGIN_MAX_RESPONSE_MB");
    }

    // ─── Capability gating ──────────────────────────────────────────

    #[test]
    fn test_every_gated_operation_checks_its_capability() {
        let fx = fixture();
        let ctx = context(&fx, &[]);

        let err = ctx.read_file("greeting.txt").unwrap_err();
        assert!(err.to_string().contains("file_read"));
        let err = ctx.write_file("out.txt", "x").unwrap_err();
        assert!(err.to_string().contains("file_write"));
        let err = ctx.fetch("https://example.com").unwrap_err();
        assert!(err.to_string().contains("network"));
        let err = ctx.notify_user("hi").unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied(_)));
        assert!(err.to_string().contains("'ui'"));

        assert!(fx.notifier.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_log_needs_no_capability() {
        let fx = fixture();
        let ctx = context(&fx, &[]);
        ctx.log("info", "plain");
        ctx.log("WARN", "upper-case level");
        ctx.log("nonsense", "falls back to info");
    }

    // ─── Files ──────────────────────────────────────────────────────

    #[test]
    fn test_read_file_from_assets() {
        let fx = fixture();
        let ctx = context(&fx, &[Capability::FileRead]);
        assert_eq!(ctx.read_file("greeting.txt").unwrap(), "hello from assets");
        assert_eq!(ctx.read_file("lyrics/song.lrc").unwrap(), "[00:01]la la");
    }

    #[test]
    fn test_read_file_missing_is_io_error() {
        let fx = fixture();
        let ctx = context(&fx, &[Capability::FileRead]);
        let err = ctx.read_file("nope.txt").unwrap_err();
        assert!(matches!(err, PluginError::Io(_)));
    }

    #[test]
    fn test_read_file_rejects_traversal() {
        let fx = fixture();
        let ctx = context(&fx, &[Capability::FileRead]);
        let err = ctx.read_file("../secret.txt").unwrap_err();
        assert!(err.to_string().contains(".."));
        let err = ctx.read_file("/etc/passwd").unwrap_err();
        assert!(err.to_string().contains("relative"));
        let err = ctx.read_file("").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[cfg(unix)]
    #[test]
    fn test_read_file_rejects_symlink_escape() {
        let fx = fixture();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            fx._assets.path().join("link.txt"),
        )
        .unwrap();

        let ctx = context(&fx, &[Capability::FileRead]);
        let err = ctx.read_file("link.txt").unwrap_err();
        assert!(err.to_string().contains("escapes"));
    }

    #[test]
    fn test_write_file_into_plugin_dir() {
        let fx = fixture();
        let ctx = context(&fx, &[Capability::FileWrite]);
        assert!(ctx.write_file("playlists/fav.json", "[1,2]").unwrap());

        let written = std::fs::read_to_string(ctx.data_dir().join("playlists/fav.json")).unwrap();
        assert_eq!(written, "[1,2]");
        assert!(ctx.data_dir().ends_with("test-plugin"));
    }

    #[test]
    fn test_write_file_failure_is_false_not_error() {
        let fx = fixture();
        let ctx = context(&fx, &[Capability::FileWrite]);
        assert!(!ctx.write_file("../escape.txt", "x").unwrap());
        assert!(!ctx.write_file("/tmp/abs.txt", "x").unwrap());
        assert!(!ctx.write_file("", "x").unwrap());
    }

    #[test]
    fn test_write_file_rejects_plugin_id_outside_data_dir() {
        let fx = fixture();
        for id in ["../escaped", "/etc", "", "a/b", "."] {
            let ctx = HostContext::new(
                fx.services.clone(),
                id.to_string(),
                [Capability::FileWrite].into_iter().collect(),
            );
            assert!(!ctx.write_file("pwned.txt", "x").unwrap(), "{id:?}");
        }
        let parent = fx._data.path().parent().unwrap();
        assert!(!parent.join("escaped/pwned.txt").exists());
    }

    // ─── Network ────────────────────────────────────────────────────

    #[test]
    fn test_fetch_blocks_private_hosts() {
        let fx = fixture();
        let ctx = context(&fx, &[Capability::Network]);
        for url in [
            "http://localhost/x",
            "http://127.0.0.1:9/x",
            "http://10.0.0.1/",
            "http://192.168.1.1/admin",
            "http://169.254.169.254/latest/meta-data/",
            "http://[::1]/",
            "http://[::ffff:127.0.0.1]/",
            "http://[::ffff:169.254.169.254]/latest/meta-data/",
            "http://[::ffff:10.1.2.3]/",
            "http://[fd00::1]/",
            "http://[fe80::1]/",
            "http://LOCALHOST./x",
            "http://metadata.google.internal/computeMetadata/v1/",
        ] {
            let body = ctx.fetch(url).unwrap();
            assert!(body.starts_with("request failed:"), "{url}: {body}");
            assert!(body.contains("blocked"), "{url}: {body}");
        }
    }

    #[test]
    fn test_fetch_invalid_url_returns_failure_string() {
        let fx = fixture();
        let ctx = context(&fx, &[Capability::Network]);
        let body = ctx.fetch("not a url").unwrap();
        assert!(body.starts_with("request failed: "));
        assert!(body.contains("invalid URL"));
    }

    #[test]
    fn test_fetch_rejects_non_http_scheme() {
        let fx = fixture();
        let ctx = context(&fx, &[Capability::Network]);
        let body = ctx.fetch("file:///etc/passwd").unwrap();
        assert!(body.contains("unsupported URL scheme"));
    }

    #[test]
    fn test_check_private_host_public_ok() {
        for url in [
            "https://8.8.8.8/",
            "https://api.example.com/v1",
            "https://[2606:4700:4700::1111]/",
            "https://[::ffff:8.8.8.8]/",
        ] {
            check_private_host(&url::Url::parse(url).unwrap()).unwrap();
        }
    }

    #[test]
    fn test_is_private_ip_covers_mapped_and_scoped_v6() {
        for ip in ["::ffff:127.0.0.1", "::ffff:192.168.0.10", "fc00::1", "fdff::1", "fe80::abcd", "febf::1"] {
            assert!(is_private_ip(ip.parse().unwrap()), "{ip}");
        }
        for ip in ["2001:db8::1", "fec0::1", "::ffff:1.1.1.1"] {
            assert!(!is_private_ip(ip.parse().unwrap()), "{ip}");
        }
    }

    // ─── UI ─────────────────────────────────────────────────────────

    #[test]
    fn test_notify_user_reaches_notifier() {
        let fx = fixture();
        let ctx = context(&fx, &[Capability::Ui]);
        ctx.notify_user("now playing\x07").unwrap();
        let seen = fx.notifier.seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[("test-plugin".to_string(), "now playing".to_string())]
        );
    }
}
