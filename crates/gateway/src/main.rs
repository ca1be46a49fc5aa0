mod admin;
mod config;
mod fetch;
mod gateway;
mod lifecycle;
mod proxy;
mod request;

use arcade_cache::{CacheStore, DiskBackend, MemoryBackend, StorageBackend};
use clap::Parser;
use config::{Config, StorageKind};
use fetch::HttpFetcher;
use gateway::Gateway;
use lifecycle::Lifecycle;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use proxy::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arcade-gateway", about = "Offline asset cache in front of a game portal")]
struct Args {
    /// Path to the TOML config file (watched for changes)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let args = Args::parse();

    // Load config
    let config = if args.config.exists() {
        match Config::load(&args.config) {
            Ok(c) => {
                tracing::info!(path = %args.config.display(), "loaded config");
                c
            }
            Err(e) => {
                tracing::error!(error = %e, path = %args.config.display(), "failed to load config, using defaults");
                Config::default_config()
            }
        }
    } else {
        tracing::info!(path = %args.config.display(), "no config found, using defaults");
        Config::default_config()
    };

    // Install Prometheus metrics recorder
    let prom_handle = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "prometheus recorder unavailable, /metrics disabled");
            None
        }
    };

    let backend: Arc<dyn StorageBackend> = match config.storage.backend {
        StorageKind::Disk => Arc::new(DiskBackend::new(config.storage.dir.clone())),
        StorageKind::Memory => Arc::new(MemoryBackend::new()),
    };
    let store = CacheStore::new(backend);

    let fetcher = HttpFetcher::new().unwrap_or_else(|e| panic!("failed to build HTTP client: {e}"));

    // Install and activate the configured generation before taking traffic
    let lifecycle = Lifecycle::new(store.clone());
    match config.generation.resolve(&store) {
        Ok(generation) => match lifecycle.install_and_activate(generation).await {
            Ok(report) => tracing::info!(
                kept = ?report.kept,
                deleted = ?report.deleted,
                failed = report.failed.len(),
                "generation activated"
            ),
            Err(e) => tracing::error!(error = %e, "activation failed, serving uncontrolled"),
        },
        Err(e) => tracing::error!(error = %e, "invalid generation, serving uncontrolled"),
    }

    let gateway = Gateway::new(
        Arc::new(fetcher),
        lifecycle.controller(),
        config.intercept_scope(),
    );

    let state = Arc::new(AppState {
        gateway,
        lifecycle,
        upstream_url: config.upstream.url.clone(),
    });

    let shutdown = CancellationToken::new();

    let admin_router = admin::router(Arc::clone(&state), prom_handle);
    let proxy_router = proxy::router(Arc::clone(&state));

    let proxy_addr = config.server.listen_addr.clone();
    let admin_addr = config.server.admin_addr.clone();

    tracing::info!(
        proxy = %proxy_addr,
        admin = %admin_addr,
        upstream = %config.upstream.url,
        general = %config.generation.general_name(),
        image = %config.generation.image_name(),
        backend = store.backend_name(),
        "arcade gateway starting"
    );

    let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind proxy to {proxy_addr}: {e}"));

    let admin_listener = tokio::net::TcpListener::bind(&admin_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind admin to {admin_addr}: {e}"));

    spawn_config_watcher(args.config, config, Arc::clone(&state));

    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    let proxy_future = axum::serve(proxy_listener, proxy_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let admin_future = axum::serve(admin_listener, admin_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        result = proxy_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy server error");
            }
        }
        result = admin_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "admin server error");
            }
        }
    }

    // In-flight background refreshes still write to their partitions
    tracing::info!(pending = state.gateway.pending_refreshes(), "waiting for refreshes");
    state.gateway.shutdown().await;

    tracing::info!("arcade gateway shut down");
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Watch the config file and apply safe changes at runtime.
fn spawn_config_watcher(config_path: PathBuf, initial_config: Config, state: Arc<AppState>) {
    let current_config = Arc::new(Mutex::new(initial_config));
    let runtime = tokio::runtime::Handle::current();

    let config_path_clone = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                match Config::load(&config_path_clone) {
                    Ok(new_config) => {
                        let mut old = current_config.lock();
                        if *old == new_config {
                            return;
                        }
                        // notify callbacks run on their own thread, outside the runtime
                        runtime.block_on(config::diff_and_apply(
                            &old,
                            &new_config,
                            &state.gateway,
                            &state.lifecycle,
                        ));
                        *old = new_config;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to reload config");
                    }
                }
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, path = %config_path.display(), "failed to watch config");
        return;
    }

    // Leak the watcher so it lives for the process lifetime
    std::mem::forget(watcher);
    tracing::info!("config file watcher started");
}
