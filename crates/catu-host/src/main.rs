//! Catu plugin host: inspect a plugin catalog or run one plugin from it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use catu_plugin::{scan_catalog, Notifier, PluginConfig, PluginManager};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "catu-host")]
#[command(version, about = "Run Catu script plugins", long_about = None)]
struct Cli {
    /// Plugin catalog directory (one sub-directory per plugin)
    #[arg(
        short,
        long,
        global = true,
        env = "PLUGIN_CATALOG_DIR",
        default_value = "./plugins"
    )]
    catalog: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the plugins in the catalog
    List,

    /// Load the catalog and execute one plugin
    Run {
        /// Plugin id
        id: String,
        /// Input as a JSON object
        #[arg(short, long, default_value = "{}")]
        input: String,
    },
}

/// Prints plugin notifications to stderr.
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, plugin_id: &str, message: &str) {
        eprintln!("[{plugin_id}] {message}");
    }
}

fn parse_input(raw: &str) -> anyhow::Result<Map<String, Value>> {
    match serde_json::from_str(raw).context("input is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("input must be a JSON object, got {other}"),
    }
}

fn list(catalog: &Path) -> anyhow::Result<()> {
    let descriptors = scan_catalog(catalog)
        .with_context(|| format!("cannot read catalog {}", catalog.display()))?;

    if descriptors.is_empty() {
        println!("no plugins in {}", catalog.display());
        return Ok(());
    }

    for d in descriptors {
        let caps: Vec<&str> = d.capabilities.iter().map(String::as_str).collect();
        println!(
            "{:<24} {:<10} [{}]  {}",
            d.id,
            d.version,
            caps.join(", "),
            d.name
        );
    }
    Ok(())
}

async fn run(catalog: &Path, id: &str, input: &str) -> anyhow::Result<()> {
    let input = parse_input(input)?;

    let manager = PluginManager::with_notifier(PluginConfig::from_env(), Arc::new(ConsoleNotifier))
        .context("failed to start plugin runtime")?;

    let loaded = manager
        .load_catalog(catalog)
        .await
        .with_context(|| format!("cannot read catalog {}", catalog.display()))?;
    tracing::info!(loaded, "catalog ready");

    let result = manager.execute_plugin(id, input).await;
    manager.shutdown().await;

    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => list(&cli.catalog),
        Commands::Run { id, input } => run(&cli.catalog, &id, &input).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input_object() {
        let map = parse_input(r#"{"msg": "hi", "n": 2}"#).unwrap();
        assert_eq!(map["msg"], Value::String("hi".into()));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_parse_input_rejects_non_object() {
        assert!(parse_input("[1, 2]").is_err());
        assert!(parse_input("\"hi\"").is_err());
        assert!(parse_input("{nope").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["catu-host", "--catalog", "/tmp/cat", "run", "echo", "-i", "{}"])
            .unwrap();
        assert_eq!(cli.catalog, PathBuf::from("/tmp/cat"));
        match cli.command {
            Commands::Run { id, input } => {
                assert_eq!(id, "echo");
                assert_eq!(input, "{}");
            }
            Commands::List => panic!("expected run"),
        }
    }

    #[test]
    fn test_list_reports_catalog_entries() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list(dir.path()).is_ok());
        assert!(list(&dir.path().join("missing")).is_err());
    }
}
