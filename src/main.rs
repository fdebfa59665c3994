//! S3Dir: S3-compatible object storage over a local directory.
//!
//! Crash-only design: every startup is a recovery. Staging scratch is
//! purged, the registry is rebuilt from sidecars, and SIGTERM/SIGINT only
//! stop accepting connections and drain in-flight requests.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use s3dir::config::{load_config, Config};
use s3dir::metadata::memory::MemoryMetadataStore;
use s3dir::metadata::sidecar::SidecarMetadataStore;
use s3dir::metadata::store::MetadataStore;
use s3dir::presign::{PresignOperation, PresignSigner};
use s3dir::registry::validate_bucket_name;
use s3dir::storage::backend::StorageBackend;
use s3dir::storage::local::LocalBackend;
use s3dir::storage::memory::MemoryBackend;
use s3dir::store::validate_key;
use s3dir::AppState;

/// Command-line arguments for the S3Dir server.
#[derive(Parser, Debug)]
#[command(name = "s3dir", version, about = "S3-compatible object storage backed by a directory")]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Override the bind address (host:port).
    #[arg(short, long, global = true)]
    bind: Option<String>,

    /// Override the data directory.
    #[arg(short, long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server (the default).
    Serve,
    /// Print a presigned URL for one object, without a running server.
    Presign {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        key: String,
        /// GET or PUT.
        #[arg(long, default_value = "GET")]
        method: String,
        /// Lifetime in seconds; defaults to `presign.default_expires`.
        #[arg(long)]
        expires: Option<u64>,
        /// Base URL the server is reachable at.
        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    init_tracing(&config);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Presign {
            bucket,
            key,
            method,
            expires,
            endpoint,
        } => {
            let endpoint = endpoint.unwrap_or_else(|| default_endpoint(&config));
            let url = presign_url(
                &config,
                &bucket,
                &key,
                &method,
                expires,
                &endpoint,
                Utc::now().timestamp(),
            )?;
            println!("{url}");
            Ok(())
        }
    }
}

/// Sign a URL for `method` on `bucket`/`key`, checking names the way the
/// server's `?presign` endpoint does.
fn presign_url(
    config: &Config,
    bucket: &str,
    key: &str,
    method: &str,
    expires: Option<u64>,
    endpoint: &str,
    now: i64,
) -> anyhow::Result<String> {
    validate_bucket_name(bucket).with_context(|| format!("invalid bucket name {bucket:?}"))?;
    validate_key(key).with_context(|| format!("invalid object key {key:?}"))?;
    let operation = PresignOperation::parse(method)
        .with_context(|| format!("cannot presign method {method}"))?;
    let secret = config
        .presign_secret()
        .context("presigning needs presign.secret or auth.secret_key to be set")?;
    let grant = PresignSigner::new(secret).issue(
        bucket,
        key,
        operation,
        expires.unwrap_or(config.presign.default_expires),
        now,
    );
    Ok(grant.url(endpoint))
}

/// Defaults, then the YAML file, then `S3DIR_*` variables, then flags.
fn resolve_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            load_config(path).with_context(|| format!("loading configuration from {path}"))?
        }
        None => Config::default(),
    };
    config.apply_env(|name| std::env::var(name).ok())?;
    if let Some(bind) = &cli.bind {
        let (host, port) = bind
            .rsplit_once(':')
            .with_context(|| format!("--bind expects HOST:PORT, got {bind}"))?;
        config.server.host = host.to_string();
        config.server.port = port
            .parse()
            .with_context(|| format!("invalid port in --bind {bind}"))?;
    }
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

/// `RUST_LOG` wins over `logging.level`.
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn default_endpoint(config: &Config) -> String {
    let host = match config.server.host.as_str() {
        "0.0.0.0" | "::" => "localhost",
        host => host,
    };
    format!("http://{host}:{}", config.server.port)
}

async fn serve(config: Config) -> anyhow::Result<()> {
    if config.observability.metrics {
        s3dir::metrics::init_metrics()?;
        info!("Prometheus metrics initialized");
    }

    let (storage, metadata): (Arc<dyn StorageBackend>, Arc<dyn MetadataStore>) =
        match config.storage.backend.as_str() {
            "memory" => {
                warn!("memory backend selected; nothing will survive a restart");
                (
                    Arc::new(MemoryBackend::new()),
                    Arc::new(MemoryMetadataStore::new()),
                )
            }
            _ => {
                let root = &config.storage.data_dir;
                let storage = LocalBackend::new(root)
                    .with_context(|| format!("opening data directory {root}"))?;
                info!(data_dir = %root, "local storage backend initialized");
                (Arc::new(storage), Arc::new(SidecarMetadataStore::new(root)?))
            }
        };

    // Every startup is a recovery.
    let purged = storage.purge_scratch().await?;
    if purged > 0 {
        info!(purged, "discarded staging and multipart scratch from a previous run");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let grace = Duration::from_secs(config.server.shutdown_timeout);
    let sweep = Duration::from_secs(config.multipart.sweep_interval_secs);
    let stale = Duration::from_secs(config.multipart.stale_after_secs);

    let state = Arc::new(AppState::new(config, storage, metadata));
    state.registry.load().await?;
    s3dir::metrics::set_bucket_count(state.registry.len());
    let reaper = state.uploads.spawn_reaper(sweep, stale);

    let app = s3dir::server::app(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!("S3Dir listening on {}", bind_addr);

    let draining = Arc::new(tokio::sync::Notify::new());
    let server = axum::serve(listener, app).with_graceful_shutdown({
        let draining = draining.clone();
        async move {
            shutdown_signal().await;
            draining.notify_one();
        }
    });

    // Stop accepting on a signal, then give in-flight requests `grace` to
    // finish. Nothing needs cleaning up: the next start recovers.
    tokio::select! {
        result = server.into_future() => result?,
        _ = async {
            draining.notified().await;
            tokio::time::sleep(grace).await;
        } => warn!(timeout_secs = grace.as_secs(), "shutdown timed out with requests in flight"),
    }

    reaper.abort();
    info!("S3Dir shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENDPOINT: &str = "http://localhost:8000";

    fn signing_config() -> Config {
        let mut config = Config::default();
        config.presign.secret = Some("cli-secret".to_string());
        config
    }

    #[test]
    fn test_presign_url_signs_valid_target() {
        let url = presign_url(&signing_config(), "photos", "cat.jpg", "GET", Some(60), ENDPOINT, 0)
            .unwrap();
        assert!(url.starts_with("http://localhost:8000/photos/cat.jpg?"));
    }

    #[test]
    fn test_presign_url_rejects_bad_targets() {
        let config = signing_config();
        for (bucket, key) in [("photos", ""), ("Bad_Bucket", "cat.jpg"), ("ab", "cat.jpg")] {
            let err = presign_url(&config, bucket, key, "GET", None, ENDPOINT, 0).unwrap_err();
            assert!(err.to_string().starts_with("invalid"), "{bucket}/{key}: {err}");
        }
        assert!(presign_url(&config, "photos", "k", "DELETE", None, ENDPOINT, 0).is_err());
    }
}
