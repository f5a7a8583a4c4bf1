//! Daemon composition root.
//!
//! Owns the process-wide components and hands out clones or references; nothing in the
//! crate reaches them through a global.

use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
#[cfg(unix)]
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::config::AetherConfig;
use crate::error::{ProtocolError, Result};
use crate::events::EventBus;
use crate::modules::telemetry::MemoryStore;
use crate::modules::{CoreModule, ModuleRegistry, TelemetryModule};
use crate::protocol::router::ModuleRouter;
use crate::transport::session_registry::SessionRegistry;
use crate::transport::tcp::TcpServer;
use crate::utils::metrics::Metrics;
use crate::utils::pool::ConnectionPool;

#[cfg(unix)]
type ControlTask = (mpsc::Sender<()>, JoinHandle<Result<()>>);

/// Request one shutdown on `shutdown` once `signal` resolves.
///
/// A signal that cannot be listened for is logged and the sender is kept alive, so the
/// daemon keeps serving instead of treating the closed channel as a shutdown request.
pub async fn forward_signal<F>(signal: F, shutdown: mpsc::Sender<()>)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Received CTRL+C signal, shutting down");
            let _ = shutdown.send(()).await;
        }
        Err(e) => {
            error!(error = %e, "Cannot listen for CTRL+C, signal shutdown disabled");
            let _keep = shutdown;
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
async fn stop_control(control: Option<ControlTask>) {
    if let Some((tx, task)) = control {
        let _ = tx.send(()).await;
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Control socket stopped with an error"),
            Err(e) => warn!(error = %e, "Control socket task failed"),
        }
    }
}

pub struct Daemon {
    config: AetherConfig,
    bus: EventBus,
    sessions: SessionRegistry,
    modules: Arc<ModuleRegistry>,
    router: Arc<ModuleRouter>,
    metrics: Arc<Metrics>,
}

impl Daemon {
    /// Daemon with the built-in modules: `core`, and `telemetry` writing to an
    /// in-memory store through a pool of `modules.pool_size` handles.
    pub fn new(config: AetherConfig) -> Result<Self> {
        let bus = EventBus::new();
        let mut modules = ModuleRegistry::new(bus.clone());

        modules.add_protocol_module(Arc::new(CoreModule::new(bus.clone())))?;

        let store = MemoryStore::new();
        let pool = ConnectionPool::open(config.modules.pool_size, |_| Ok(store.clone()))?;
        modules.add_protocol_module(Arc::new(TelemetryModule::new(bus, pool)))?;

        Self::with_modules(config, modules)
    }

    /// Daemon around an already populated module registry.
    pub fn with_modules(config: AetherConfig, modules: ModuleRegistry) -> Result<Self> {
        config.validate_strict()?;
        let router = Arc::new(modules.router()?);
        info!(modules = modules.len(), handlers = router.len(), "Daemon assembled");

        Ok(Self {
            bus: modules.bus().clone(),
            sessions: SessionRegistry::new(),
            modules: Arc::new(modules),
            router,
            metrics: Arc::new(Metrics::new()),
            config,
        })
    }

    pub fn config(&self) -> &AetherConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Device directory, for server-initiated sends
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn tcp_server(&self) -> TcpServer {
        TcpServer::new(
            &self.config,
            self.router.clone(),
            self.sessions.clone(),
            self.metrics.clone(),
        )
    }

    /// Bind the device listener. Failure here must abort startup.
    pub async fn bind(&self) -> Result<TcpListener> {
        self.tcp_server().bind().await
    }

    /// Bind, serve until `shutdown` fires, then stop every module.
    pub async fn run(self, shutdown: mpsc::Receiver<()>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    #[instrument(name = "daemon", skip_all)]
    pub async fn serve(self, listener: TcpListener, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        #[cfg(unix)]
        let control: Option<ControlTask> = if self.config.control.enabled {
            use crate::transport::control::ControlServer;

            let server = ControlServer::new(&self.config.control.socket_path, self.modules.clone())
                .with_stop_timeout(self.config.server.module_stop_timeout)
                .with_drain_timeout(self.config.server.shutdown_timeout);
            let socket = server.bind().await?;
            let (tx, rx) = mpsc::channel::<()>(1);
            Some((tx, tokio::spawn(server.serve(socket, rx))))
        } else {
            None
        };

        if let Err(e) = self.modules.start_all() {
            #[cfg(unix)]
            stop_control(control).await;
            return Err(e);
        }

        let (tcp_tx, tcp_rx) = mpsc::channel::<()>(1);
        let tcp = tokio::spawn(self.tcp_server().serve(listener, tcp_rx));
        info!("Daemon running");

        shutdown.recv().await;
        info!("Shutdown requested");

        let _ = tcp_tx.send(()).await;
        match tcp.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Device server stopped with an error"),
            Err(e) => warn!(error = %e, "Device server task failed"),
        }

        #[cfg(unix)]
        stop_control(control).await;

        let modules = self.modules.clone();
        let limit = self.config.server.module_stop_timeout;
        let stopped = tokio::task::spawn_blocking(move || match limit {
            Some(limit) => modules.stop_all_within(limit),
            None => modules.stop_all(),
        })
        .await
        .map_err(|e| ProtocolError::Custom(format!("shutdown barrier task failed: {e}")))?;

        self.modules.detach();
        self.metrics.log_metrics();
        info!("Daemon stopped");
        stopped
    }
}
