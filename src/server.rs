//! Server composition root: builds the context, starts listeners, workers,
//! the scheduler clock and the file watcher, then runs until told to stop.
//!
//! Restart (from the restart timer/schedules, the file watcher, or a
//! programmatic signal) is a graceful teardown followed by re-running the
//! setup function against a fresh context. Shared state and the restart
//! counter are carried across the reinit.

use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::listener;
use crate::scheduler::{self, restart, ControlSignal, WorkerPool};
use crate::watcher;
use may::sync::mpsc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Runtime tuning, from the environment.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// Worker executors draining the connection queue (`PODE_WORKERS`).
    pub workers: usize,
    /// Coroutine stack size in bytes (`PODE_STACK_SIZE`, decimal or 0x hex).
    pub stack_size: usize,
    /// Grace period for in-flight work during shutdown.
    pub grace: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            stack_size: 0x10000,
            grace: Duration::from_secs(10),
        }
    }
}

impl RuntimeOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let workers = std::env::var("PODE_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(defaults.workers);
        let stack_size = std::env::var("PODE_STACK_SIZE")
            .ok()
            .and_then(|s| {
                if let Some(hex) = s.strip_prefix("0x") {
                    usize::from_str_radix(hex, 16).ok()
                } else {
                    s.parse().ok()
                }
            })
            .unwrap_or(defaults.stack_size);
        Self {
            workers,
            stack_size,
            ..defaults
        }
    }
}

type SetupFn = dyn Fn(&mut ServerContext) -> anyhow::Result<()> + Send + Sync;
type StopHandler = dyn Fn() + Send + Sync;

/// The server: configuration plus the setup function re-run on every
/// (re)start.
pub struct Server {
    config: ServerConfig,
    options: RuntimeOptions,
    setup: Arc<SetupFn>,
    watch_paths: Vec<PathBuf>,
    on_stop: Vec<Arc<StopHandler>>,
    control_tx: mpsc::Sender<ControlSignal>,
    control_rx: mpsc::Receiver<ControlSignal>,
}

impl Server {
    /// Create a server whose endpoints, routes and handlers are declared by
    /// `setup`. The function runs once per start and once per restart.
    pub fn new<F>(config: ServerConfig, setup: F) -> Self
    where
        F: Fn(&mut ServerContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let (control_tx, control_rx) = mpsc::channel();
        Self {
            config,
            options: RuntimeOptions::from_env(),
            setup: Arc::new(setup),
            watch_paths: Vec::new(),
            on_stop: Vec::new(),
            control_tx,
            control_rx,
        }
    }

    pub fn with_options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Watch a path and restart when anything under it changes.
    pub fn watch(mut self, path: impl Into<PathBuf>) -> Self {
        self.watch_paths.push(path.into());
        self
    }

    /// Register a handler invoked during graceful shutdown.
    pub fn on_stop<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_stop.push(Arc::new(handler));
        self
    }

    /// A handle other threads can use to request restart or shutdown.
    pub fn control(&self) -> mpsc::Sender<ControlSignal> {
        self.control_tx.clone()
    }

    /// Run until a shutdown signal arrives. Blocks the calling thread.
    pub fn run(self) -> Result<()> {
        let Server {
            config,
            options,
            setup,
            watch_paths,
            on_stop,
            control_tx,
            control_rx,
        } = self;

        // Carried across restarts.
        let mut carried_state: Option<crate::state::SharedState> = None;
        let mut restart_count = 0u32;
        let mut last_restart = None;

        loop {
            let mut ctx = ServerContext::with_config(config.clone());
            setup(&mut ctx).map_err(|e| Error::config(format!("server setup failed: {e}")))?;
            if ctx.endpoints.is_empty() {
                return Err(Error::config("no endpoints configured"));
            }
            {
                let runtime = ctx.runtime();
                let mut rt = runtime.lock().unwrap();
                if let Some(state) = carried_state.take() {
                    rt.state = state;
                }
                rt.restart_count = restart_count;
                rt.last_restart = last_restart;
            }

            restart::install_restart_jobs(
                &ctx.config.server.restart,
                &ctx.runtime(),
                control_tx.clone(),
            )?;

            let ctx = Arc::new(ctx);
            let stop = Arc::new(AtomicBool::new(false));

            let pool = WorkerPool::start(ctx.clone(), options.workers, options.stack_size);
            let listener = listener::start(ctx.clone(), pool.sender(), options.stack_size)?;
            let clock = scheduler::spawn_clock(
                ctx.runtime(),
                pool.sender(),
                stop.clone(),
                options.stack_size,
            )
            .map_err(Error::Io)?;

            let _watcher = if watch_paths.is_empty() {
                None
            } else {
                Some(
                    watcher::watch_paths(
                        &watch_paths,
                        control_tx.clone(),
                        watcher::DEFAULT_DEBOUNCE,
                    )
                    .map_err(|e| Error::config(format!("file watcher failed: {e}")))?,
                )
            };

            info!(
                endpoints = ctx.endpoints.len(),
                workers = options.workers,
                restart_count,
                "server started"
            );

            let signal = control_rx.recv().unwrap_or(ControlSignal::Shutdown);

            info!(?signal, "stopping: closing listeners");
            stop.store(true, Ordering::SeqCst);
            listener.stop();
            pool.shutdown(options.grace);
            unsafe {
                clock.coroutine().cancel();
            }
            let _ = clock.join();

            for handler in &on_stop {
                handler();
            }

            match signal {
                ControlSignal::Restart => {
                    let rt = ctx.runtime();
                    let mut guard = rt.lock().unwrap();
                    guard.note_restart();
                    restart_count = guard.restart_count;
                    last_restart = guard.last_restart;
                    carried_state = Some(std::mem::take(&mut guard.state));
                    drop(guard);
                    info!(restart_count, "restarting");
                }
                ControlSignal::Shutdown => {
                    info!("server stopped");
                    return Ok(());
                }
            }
        }
    }
}

/// Initialise tracing the way the binary expects it: env-filter driven,
/// defaulting to `info`.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
