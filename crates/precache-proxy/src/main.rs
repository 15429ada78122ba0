mod admin;
mod config;
mod network;
mod proxy;

use admin::{record_activate, record_install, skip_waiting_handler, stats_handler};
use axum::routing::{any, get, post};
use axum::Router;
use clap::Parser;
use config::{Backend, Config};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use network::UpstreamNetwork;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use precache_core::disk::DiskStorage;
use precache_core::memory::MemoryStorage;
use precache_core::{CacheStorage, PrecacheManifest, Registration, UpdateOutcome};
use proxy::{intercept_handler, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

/// Offline caching proxy for a static site.
#[derive(Parser)]
#[command(name = "precache-proxy")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let args = Args::parse();

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
        tracing::info!(path = %args.config.display(), "no config file found, using defaults");
        Config::default_config()
    };

    let prom_handle = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()
    {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "failed to install prometheus recorder");
            std::process::exit(1);
        }
    };

    let storage: Arc<dyn CacheStorage> = match config.cache.backend {
        Backend::Memory => Arc::new(MemoryStorage::new()),
        Backend::Disk => match DiskStorage::open_at(&config.cache.dir).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                tracing::error!(error = %e, dir = %config.cache.dir.display(), "failed to open disk cache");
                std::process::exit(1);
            }
        },
    };

    let client = Client::builder(TokioExecutor::new()).build_http();
    let network = Arc::new(UpstreamNetwork::new(client, config.upstream.url.clone()));
    let registration = Arc::new(
        Registration::new(storage, network.clone())
            .with_client_idle_timeout(config.precache.client_idle_timeout()),
    );

    let state = Arc::new(AppState {
        registration: Arc::clone(&registration),
        network,
    });

    // Install in the background; until a worker activates, requests pass through.
    match config.precache.manifest() {
        Ok(manifest) => {
            let registration = Arc::clone(&registration);
            let skip_waiting = config.precache.skip_waiting;
            tokio::spawn(async move {
                register_manifest(&registration, manifest, skip_waiting).await;
            });
        }
        Err(e) => tracing::error!(error = %e, "invalid precache manifest, serving in passthrough"),
    }

    let shutdown = CancellationToken::new();

    let admin_router = admin_router(Arc::clone(&state)).route(
        "/metrics",
        get(move || {
            let h = prom_handle.clone();
            async move { h.render() }
        }),
    );
    let proxy_router = proxy_router(Arc::clone(&state));

    let proxy_addr = config.server.listen_addr.clone();
    let metrics_addr = config.server.metrics_addr.clone();

    tracing::info!(
        proxy = %proxy_addr,
        metrics = %metrics_addr,
        upstream = %config.upstream.url,
        backend = ?config.cache.backend,
        version = %config.precache.version,
        precache_urls = config.precache.urls.len(),
        "precache proxy starting"
    );

    let proxy_listener = match tokio::net::TcpListener::bind(&proxy_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %proxy_addr, "failed to bind proxy");
            std::process::exit(1);
        }
    };
    let metrics_listener = match tokio::net::TcpListener::bind(&metrics_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %metrics_addr, "failed to bind metrics");
            std::process::exit(1);
        }
    };

    spawn_client_sweeper(Arc::clone(&registration), shutdown.clone());
    spawn_config_watcher(args.config.clone(), config, Arc::clone(&registration));

    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    let proxy_future = axum::serve(
        proxy_listener,
        proxy_router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let metrics_future = axum::serve(metrics_listener, admin_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        result = proxy_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy server error");
            }
        }
        result = metrics_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        }
    }

    // Let in-flight installs and cache writes land before exiting.
    registration.shutdown().await;
    tracing::info!("precache proxy shut down");
}

fn proxy_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{*path}", any(intercept_handler))
        .route("/", any(intercept_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/skip-waiting", post(skip_waiting_handler))
        .with_state(state)
}

/// Install a worker for `manifest` and log what happened. Install failures
/// leave the current worker (if any) in charge; the registration retries on
/// the next page load.
pub(crate) async fn register_manifest(
    registration: &Arc<Registration>,
    manifest: PrecacheManifest,
    skip_waiting: bool,
) {
    let version = manifest.version().to_string();
    match registration.register(manifest, skip_waiting).await {
        Ok(UpdateOutcome::Activated { generation, report }) => {
            record_install(true);
            record_activate();
            tracing::info!(
                generation = %generation,
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                claimed = report.claimed,
                "precache generation active"
            );
        }
        Ok(UpdateOutcome::Waiting { generation }) => {
            record_install(true);
            tracing::info!(generation = %generation, "precache generation installed, waiting");
        }
        Ok(UpdateOutcome::Unchanged) => {
            tracing::debug!(version = %version, "precache generation already installed");
        }
        Err(e) => {
            record_install(false);
            tracing::error!(version = %version, error = %e, "precache install failed, will retry on next page load");
        }
    }
}

/// Periodically forget idle clients so a waiting worker can take over once
/// the pages of its predecessor are gone.
fn spawn_client_sweeper(registration: Arc<Registration>, shutdown: CancellationToken) {
    let period = (registration.clients().idle_timeout() / 4).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match registration.expire_clients().await {
                Ok(Some(UpdateOutcome::Activated { generation, report })) => {
                    record_activate();
                    tracing::info!(
                        generation = %generation,
                        deleted = report.deleted.len(),
                        "waiting generation activated after idle clients expired"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "activating waiting worker failed"),
            }
        }
    });
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
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C only");
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

/// Watch the config file and apply precache version bumps at runtime.
fn spawn_config_watcher(config_path: PathBuf, initial_config: Config, registration: Arc<Registration>) {
    if !config_path.exists() {
        tracing::info!(path = %config_path.display(), "config file absent, hot reload disabled");
        return;
    }

    let current_config = Arc::new(Mutex::new(initial_config));
    let runtime = tokio::runtime::Handle::current();

    let config_path_clone = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                match Config::load(&config_path_clone) {
                    Ok(new_config) => {
                        let mut old = current_config.lock();
                        config::diff_and_apply(&old, &new_config, &registration, &runtime);
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
        tracing::warn!(error = %e, "failed to watch config file");
        return;
    }

    // Leak the watcher so it lives for the process lifetime
    std::mem::forget(watcher);
    tracing::info!("config file watcher started");
}
