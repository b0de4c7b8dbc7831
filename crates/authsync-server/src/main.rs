//! authsync: central process for cross-context credential sync.

use std::path::PathBuf;
use std::sync::Arc;

use authsync_core::{DataPaths, SyncConfig};
use authsync_reconcile::{NoTabProber, ReconciliationBootstrapper};
use authsync_server::{build_router, AppState};
use authsync_store::{
    CanonicalReader, CanonicalStoreManager, FileCanonicalStore, HttpVerifier, RemoteVerifier,
};
use authsync_transport::{HttpChannel, RetryPolicy, SyncTransport};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn resolve_data_dir() -> PathBuf {
    std::env::var("AUTHSYNC_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

fn load(data_dir: PathBuf) -> anyhow::Result<(DataPaths, SyncConfig)> {
    let paths = DataPaths::new(&data_dir)?;
    let config = SyncConfig::from_env(&paths)?;
    Ok((paths, config))
}

fn open_manager(paths: &DataPaths, config: &SyncConfig) -> anyhow::Result<CanonicalStoreManager> {
    let backend = Arc::new(FileCanonicalStore::new(&paths.canonical_file));
    let verifier = match &config.verify_url {
        Some(url) => {
            let verifier: Arc<dyn RemoteVerifier> =
                Arc::new(HttpVerifier::new(url, config.verifier_timeout())?);
            info!("Remote verifier: {}", url);
            Some(verifier)
        }
        None => None,
    };
    Ok(CanonicalStoreManager::new(backend, verifier).with_unverified_grace(config.unverified_grace()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "status" => {
                let (paths, config) = load(resolve_data_dir())?;
                let status = open_manager(&paths, &config)?.status()?;
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            "bootstrap" => {
                let (paths, config) = load(resolve_data_dir())?;
                let daemon = format!("http://127.0.0.1:{}", config.port);
                let transport = SyncTransport::new(
                    Arc::new(HttpChannel::new(&daemon)),
                    RetryPolicy::from_config(&config),
                )
                .with_context("cli");
                let mut bootstrapper = ReconciliationBootstrapper::new(
                    &config,
                    CanonicalReader::from_file(&paths.canonical_file),
                    transport,
                    Arc::new(NoTabProber),
                );
                let report = bootstrapper.run().await;
                let phases: Vec<String> = report
                    .phases
                    .iter()
                    .map(|p| format!("{:?}", p))
                    .collect();
                match report.credentials() {
                    Some(set) => println!("READY {} [{}]", set.fingerprint(), phases.join(" -> ")),
                    None => println!("NOT_AUTHENTICATED [{}]", phases.join(" -> ")),
                }
                std::process::exit(if report.is_ready() { 0 } else { 1 });
            }
            "--help" | "-h" | "help" => {
                println!("authsync: cross-context credential sync daemon");
                println!();
                println!("Usage: authsync [command]");
                println!();
                println!("Commands:");
                println!("  (none)       Start the daemon");
                println!("  status       Print the canonical store status");
                println!("  bootstrap    Reconcile against a running daemon and print the outcome");
                println!("  help         Show this help message");
                println!();
                println!("Environment: AUTHSYNC_DATA_DIR, AUTHSYNC_PORT, AUTHSYNC_VERIFY_URL, RUST_LOG");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'authsync help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    let (paths, config) = load(data_dir)?;
    let port = config.port;
    let manager = Arc::new(open_manager(&paths, &config)?);
    info!("Canonical store: {}", paths.canonical_file.display());

    let state = Arc::new(AppState::new(config, paths, manager));
    let app = build_router(state);

    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("authsync listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
