use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use schema_registry_server::registry::Registry;
use schema_registry_server::rest;
use schema_registry_server::storage::{KeyValueStore, MemoryKeyValue};

#[derive(Parser, Debug)]
#[command(name = "schemaregistry")]
#[command(about = "Confluent-compatible schema registry")]
struct Args {
    /// Store connection URL; `memory://` runs the in-process store
    #[arg(long, env = "STORE_URL", default_value = "memory://")]
    store_url: String,

    /// HTTP server address
    #[arg(long, env = "HTTP_ADDR", default_value = ":8081")]
    http_addr: String,

    /// Bucket for schema records
    #[arg(long, env = "SCHEMA_BUCKET", default_value = "SCHEMAS")]
    schema_bucket: String,

    /// Bucket for compatibility configuration
    #[arg(long, env = "CONFIG_BUCKET", default_value = "CONFIG")]
    config_bucket: String,

    /// Enable debug logging
    #[arg(long, env = "DEBUG", default_value_t = false)]
    debug: bool,

    /// Test mode: run against an in-process store for self-contained runs
    #[arg(long = "test", env = "TEST_MODE", default_value_t = false)]
    test_mode: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(?args, "starting schema registry server");

    let (kv_schemas, kv_config) = select_stores(&args);
    let registry = Arc::new(Registry::new(kv_schemas, kv_config));
    registry.wait_ready(Duration::from_secs(5)).await?;
    info!("registry ready");

    let addr = normalize_addr(&args.http_addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "HTTP server listening");

    let router = rest::router(registry.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    registry.shutdown().await;
    Ok(())
}

/// Picks the storage backend for the two buckets.
///
/// External store adapters are wired by the deployment through the library
/// API; the binary itself serves test mode and the in-process fallback.
fn select_stores(args: &Args) -> (Arc<dyn KeyValueStore>, Arc<dyn KeyValueStore>) {
    if !args.test_mode && args.store_url != "memory://" {
        warn!(
            store_url = %args.store_url,
            "external store is not reachable from the standalone binary; \
             continuing with the in-process store (no persistence)"
        );
    }
    (
        Arc::new(MemoryKeyValue::new(args.schema_bucket.clone())),
        Arc::new(MemoryKeyValue::new(args.config_bucket.clone())),
    )
}

/// Accepts both `:8081` and full `host:port` forms.
fn normalize_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
