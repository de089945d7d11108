//! wakegate entry point: CLI parsing, logging init, config load, and the
//! background task wiring (HTTP listener, idle sweeper, discovery loop,
//! rate-limiter cleanup) around a [`wakegate::server::Server`].

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wakegate::config::{apply_env_overrides, Config, RawConfig};
use wakegate::discovery::DiscoveryMerger;
use wakegate::lifecycle::LifecycleManager;
use wakegate::runtime::DockerRuntime;
use wakegate::server::Server;

#[derive(Parser)]
#[command(name = "wakegate", version, about = "Wakes Docker workloads on demand and proxies to them once running")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, env = "GATEWAY_CONFIG", default_value = "wakegate.yaml")]
    config: String,

    /// Emit logs as JSON instead of the default human-readable format.
    #[arg(long, env = "GATEWAY_LOG_JSON")]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file '{path}'"))?;
    let mut raw = RawConfig::from_yaml(&text).context("failed to parse configuration")?;
    apply_env_overrides(&mut raw);
    raw.into_config().context("configuration failed validation")
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let config = match load_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run(config, args.config))
}

async fn run(config: Config, config_path: String) -> Result<()> {
    let docker = match DockerRuntime::connect() {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "failed to connect to the container runtime");
            std::process::exit(1);
        }
    };
    let docker: Arc<dyn wakegate::runtime::RuntimeAdapter> = Arc::new(docker);

    let port = config.gateway.port;
    let discovery_interval = config.gateway.discovery_interval;

    let lifecycle = Arc::new(LifecycleManager::new());
    let server = Arc::new(Server::new(config.clone(), Arc::clone(&lifecycle), Arc::clone(&docker)));

    let cancel = CancellationToken::new();

    let discovery = Arc::new(DiscoveryMerger::new(Arc::clone(&docker), config.clone()));
    let discovery_task = {
        let discovery = Arc::clone(&discovery);
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            discovery
                .run(discovery_interval, cancel, move |merged| {
                    server.reload_indices(merged);
                })
                .await;
        })
    };

    let sweeper_task = lifecycle.clone().spawn_idle_sweeper(
        Arc::clone(&docker),
        Arc::clone(&server.indices),
        cancel.clone(),
    );

    let rate_limit_cleanup_task = {
        // The Server owns its own RateLimiter; this task runs cleanup against
        // it directly rather than through a second limiter instance.
        let cancel = cancel.clone();
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5 * 60));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => server.rate_limiter.cleanup(),
                }
            }
        })
    };

    let sighup_task = {
        let discovery = Arc::clone(&discovery);
        tokio::spawn(async move {
            let Ok(mut stream) = signal(SignalKind::hangup()) else {
                warn!("failed to install SIGHUP handler, config reload via signal disabled");
                return;
            };
            loop {
                stream.recv().await;
                info!("received SIGHUP, reloading configuration");
                match load_config(&config_path) {
                    Ok(new_config) => discovery.reload(new_config),
                    Err(e) => error!(error = %e, "SIGHUP reload failed, keeping previous configuration"),
                }
            }
        })
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "wakegate listening");

    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        serve_cancel.cancel();
    });

    let serve_result = server.serve(addr, cancel.clone()).await;

    cancel.cancel();
    sighup_task.abort();
    discovery_task.abort();
    sweeper_task.abort();
    rate_limit_cleanup_task.abort();

    serve_result
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler, only ctrl-c will trigger shutdown");
            let _ = ctrl_c.await;
            return;
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
}
