//! CLI entry point: a one-shot ingestion run by default, or the HTTP control
//! plane under the `serve` subcommand.

use anyhow::{bail, Context};
use biblio_ingest::config::runtime::RuntimeConfigProvider;
use biblio_ingest::config::{self, BootstrapConfig};
use biblio_ingest::models::{Task, TaskStatus};
use biblio_ingest::pipeline::{self, TaskHandle};
use biblio_ingest::progress::{self, ProgressMode};
use biblio_ingest::server;
use biblio_ingest::source_client::SourceClient;
use biblio_ingest::task_manager::TaskManager;
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "biblio-ingest", about = "Bibliographic-attachment ingestion pipeline", version)]
struct Cli {
    /// Path to the process bootstrap config file.
    #[arg(long, global = true, default_value = "./config/bibliograph.toml")]
    config: PathBuf,

    /// Comma-separated collection keys to scope this run to.
    #[arg(long)]
    collections: Option<String>,

    /// Ingest the entire library, ignoring any collection scope.
    #[arg(long)]
    all_items: bool,

    /// Prompt for collection selection from the bridge's collection list.
    #[arg(long)]
    interactive: bool,

    /// Disable recursive descent into subcollections for this run.
    #[arg(long)]
    no_recursive: bool,

    /// Override the source-client pagination page size for this run.
    #[arg(long)]
    page_size: Option<u32>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP control plane instead of running one-shot.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let bootstrap = config::load_bootstrap(&cli.config)?;
    init_tracing(bootstrap.log_filter.as_deref());

    let runtime_config = Arc::new(RuntimeConfigProvider::new(bootstrap.runtime_config_path())?);

    match cli.command {
        Some(Commands::Serve) => {
            let tasks = Arc::new(TaskManager::new(
                bootstrap.data_dir.clone(),
                Arc::clone(&runtime_config),
                bootstrap.max_concurrent_tasks,
            ));
            server::run_server(&bootstrap.server.bind, tasks, runtime_config).await
        }
        None => match run_one_shot(&cli, &bootstrap, &runtime_config).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "one-shot ingestion did not complete");
                eprintln!("error: {e:#}");
                std::process::exit(1);
            }
        },
    }
}

fn init_tracing(log_filter: Option<&str>) {
    let filter = log_filter
        .map(|f| f.to_string())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

async fn run_one_shot(cli: &Cli, bootstrap: &BootstrapConfig, runtime_config: &Arc<RuntimeConfigProvider>) -> anyhow::Result<()> {
    if cli.no_recursive || cli.page_size.is_some() {
        let mut patch = serde_json::Map::new();
        let mut zotero = serde_json::Map::new();
        if cli.no_recursive {
            zotero.insert("collection_recursive".to_string(), serde_json::json!(false));
        }
        if let Some(page_size) = cli.page_size {
            zotero.insert("collection_page_size".to_string(), serde_json::json!(page_size));
        }
        patch.insert("zotero".to_string(), serde_json::Value::Object(zotero));
        runtime_config.update(&serde_json::Value::Object(patch)).context("applying CLI config overrides")?;
    }

    let snapshot = runtime_config.snapshot();
    let dify_key = snapshot.get("dify").and_then(|d| d.get("api_key")).and_then(|v| v.as_str()).unwrap_or_default();
    if dify_key.is_empty() {
        bail!("missing required credential: dify.api_key (set it via PUT /config or the DIFY_API_KEY env var)");
    }
    let mcp_url = snapshot.get("zotero").and_then(|z| z.get("mcp_url")).and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let source = SourceClient::new(mcp_url.clone());
    if !source.check_connection().await {
        bail!("reference-manager bridge unreachable at {mcp_url}");
    }

    let collection_keys = resolve_collection_keys(cli, &source).await?;

    let version = runtime_config.version();
    let task = Task::new(collection_keys, snapshot, version);
    let handle = Arc::new(TaskHandle::new(task));
    let cancel = CancellationToken::new();
    let data_dir = bootstrap.data_dir.clone();

    let reporter = ProgressMode::default_for_tty().reporter();
    let watch_handle = Arc::clone(&handle);
    let watcher = tokio::spawn(async move {
        progress::watch(&watch_handle, reporter.as_ref()).await;
    });

    pipeline::run(Arc::clone(&handle), cancel, data_dir).await;
    let _ = watcher.await;

    let final_status = handle.task.lock().expect("task lock poisoned").status;
    match final_status {
        TaskStatus::Failed => bail!("task failed: {}", handle.task.lock().expect("task lock poisoned").error),
        _ => Ok(()),
    }
}

/// Resolve the collection scope for this run: `--all-items` and no
/// `--collections`/`--interactive` both mean "entire library" (empty scope,
/// per C1 §4.1); `--interactive` prompts from the bridge's collection list.
async fn resolve_collection_keys(cli: &Cli, source: &SourceClient) -> anyhow::Result<Vec<String>> {
    if let Some(collections) = &cli.collections {
        return Ok(collections.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect());
    }
    if cli.all_items {
        return Ok(Vec::new());
    }
    if cli.interactive {
        let collections = source.list_collections().await.context("listing collections for interactive selection")?;
        if collections.is_empty() {
            println!("no collections found; ingesting the entire library");
            return Ok(Vec::new());
        }
        println!("available collections:");
        for (i, c) in collections.iter().enumerate() {
            let name = c.get("name").and_then(|v| v.as_str()).unwrap_or("(unnamed)");
            let key = c.get("key").and_then(|v| v.as_str()).unwrap_or("");
            println!("  {}) {name} [{key}]", i + 1);
        }
        println!("enter comma-separated collection keys (blank for entire library):");
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        return Ok(line.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect());
    }
    Ok(Vec::new())
}
