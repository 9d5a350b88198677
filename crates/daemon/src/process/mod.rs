//! Daemon lifecycle: logging, signal handling, task spawning, and
//! coordinated shutdown over a single watch channel.

use std::time::Duration;

use futures::future::join_all;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::admin::AdminChannel;
use crate::http_server;
use crate::signer::SignerEndpoint;
use crate::state::{State, StateChannels};
use crate::ServiceConfig;

/// Drain window a SIGTERM gets before listeners actually stop, so an
/// in-flight approval has a chance to land.
const SIGTERM_DRAIN: Duration = Duration::from_secs(10);
/// How long spawned tasks get to wind down once shutdown is signalled.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Handle for gracefully shutting down the daemon service.
pub struct ShutdownHandle {
    signal_waiter: JoinHandle<()>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<()>,
}

impl ShutdownHandle {
    /// Block until the service shuts down (via signal or explicit shutdown).
    pub async fn wait(self) {
        let _ = self.signal_waiter.await;
        if timeout(SHUTDOWN_DEADLINE, join_all(self.handles))
            .await
            .is_err()
        {
            tracing::error!(
                "tasks did not stop within {}s, aborting",
                SHUTDOWN_DEADLINE.as_secs()
            );
            std::process::exit(4);
        }
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Translate SIGINT/SIGTERM into the shared shutdown watch channel.
/// SIGINT stops immediately; SIGTERM waits out the drain window first.
fn watch_for_signals() -> (JoinHandle<()>, watch::Sender<()>, watch::Receiver<()>) {
    let mut interrupt = signal(SignalKind::interrupt()).expect("signal handler installs");
    let mut terminate = signal(SignalKind::terminate()).expect("signal handler installs");

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let notify = shutdown_tx.clone();

    let waiter = tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {
                tracing::debug!("SIGINT received, stopping now");
            }
            _ = terminate.recv() => {
                tracing::debug!("SIGTERM received, draining before stop");
                tokio::time::sleep(SIGTERM_DRAIN).await;
            }
        }
        let _ = notify.send(());
    });

    (waiter, shutdown_tx, shutdown_rx)
}

/// Route panics through `tracing` so they reach the log files, not
/// just stderr.
fn hook_panics() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(%location, "panic: {}", info);
    }));
}

fn env_filter(config: &ServiceConfig) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(config.log_level.into())
        .from_env_lossy()
}

/// Install the tracing subscriber: compact stdout always, plus a
/// daily-rolling file when a log directory is configured. The returned
/// guards flush the writers and must outlive the daemon.
fn init_logging(config: &ServiceConfig) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    let mut guards = Vec::new();

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(env_filter(config));

    let file_layer = config.log_dir.as_ref().map(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("warning: could not create log directory {}: {}", dir.display(), e);
        }
        let appender = tracing_appender::rolling::daily(dir, "bunkerd.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
        guards.push(file_guard);
        tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_filter(env_filter(config))
    });

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    hook_panics();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "bunker starting");

    guards
}

/// Create service state from config, exiting on error.
async fn create_state(service_config: &ServiceConfig) -> (State, StateChannels) {
    match State::from_config(service_config).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("failed to initialise service state: {}", e);
            std::process::exit(3);
        }
    }
}

/// Create state and spawn background tasks, returning the state handle.
///
/// The returned `ShutdownHandle` must be kept alive; dropping it does
/// not stop the service.
pub async fn start_service(service_config: &ServiceConfig) -> (State, ShutdownHandle) {
    let (signal_waiter, shutdown_tx, shutdown_rx) = watch_for_signals();
    let (state, channels) = create_state(service_config).await;
    let StateChannels {
        acl_rx,
        mut key_rx,
    } = channels;

    let mut handles = Vec::new();

    // Control loop: brings up a signer endpoint for every key that
    // becomes live, at boot and later (unlock, provisioning)
    let control_state = state.clone();
    let control_shutdown = shutdown_rx.clone();
    let control_handle = tokio::spawn(async move {
        let mut shutdown = control_shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                activation = key_rx.recv() => {
                    let Some(activation) = activation else { break };
                    let relays = control_state.relays().await;
                    let endpoint = SignerEndpoint::new(
                        activation.name.clone(),
                        activation.keys,
                        relays,
                        control_state.clone(),
                    );
                    let endpoint_shutdown = control_shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = endpoint.run(endpoint_shutdown).await {
                            tracing::error!("signer endpoint error: {}", e);
                        }
                    });
                }
            }
        }
    });
    handles.push(control_handle);

    // Admin channel (management RPCs, acl relay path, heartbeat)
    let admin_relays = state.admin_relays().await;
    let admin = AdminChannel::new(state.clone(), admin_relays, acl_rx);
    let admin_shutdown = shutdown_rx.clone();
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin.run(admin_shutdown).await {
            tracing::error!("admin channel error: {}", e);
        }
    });
    handles.push(admin_handle);

    // HTTP server (approval pages, dashboard API)
    let http_state = state.clone();
    let http_shutdown = shutdown_rx.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server::run(http_state, http_shutdown).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });
    handles.push(http_handle);

    // make the boot-time keys live; the control loop picks them up
    for (name, keys) in &service_config.unlocked_keys {
        state.load_active_key(name, keys.clone()).await;
    }

    tracing::info!(
        keys = service_config.unlocked_keys.len(),
        "bunker running: signer endpoints + admin channel + HTTP"
    );

    let handle = ShutdownHandle {
        signal_waiter,
        handles,
        shutdown_tx,
    };

    (state, handle)
}

/// Spawns the daemon service and blocks until a shutdown signal.
/// Use for CLI binary usage.
pub async fn spawn_service(service_config: &ServiceConfig) {
    let _guards = init_logging(service_config);
    let (state, handle) = start_service(service_config).await;
    handle.wait().await;
    // unlocked secrets do not outlive the process
    state.clear_active_keys().await;
}
