pub mod commands;
pub mod config;
pub mod connection;
pub mod events;
pub mod registry;
pub mod serial;
pub mod storage;
pub mod telemetry;
pub mod tls;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use commands::CommandCoordinator;
use config::GatewayConfig;
use events::{ConnectionNotifier, EventBus};
use registry::DeviceRegistry;
use storage::Storage;
use tls::TlsListener;

/// Shared state handed to every connection task and to the REST surface.
pub struct GatewayContext {
    pub config: Arc<GatewayConfig>,
    pub storage: Arc<Storage>,
    pub events: Arc<EventBus>,
    pub notifier: Arc<ConnectionNotifier>,
    pub registry: Arc<DeviceRegistry>,
    pub coordinator: Arc<CommandCoordinator>,
}

impl GatewayContext {
    pub async fn new(config: GatewayConfig) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let storage = Arc::new(Storage::new(&config.data_dir).await?);
        let events = Arc::new(EventBus::new());
        let notifier = Arc::new(ConnectionNotifier::new());
        let registry = Arc::new(DeviceRegistry::new(
            config.session_timeout,
            config.gc_interval,
            events.clone(),
            notifier.clone(),
        ));
        let coordinator = Arc::new(CommandCoordinator::new(storage.clone(), registry.clone()));
        Ok(Arc::new(Self {
            config,
            storage,
            events,
            notifier,
            registry,
            coordinator,
        }))
    }
}

/// The running gateway: bound listeners plus the GC timer.
pub struct Gateway {
    pub ctx: Arc<GatewayContext>,
    listeners: Vec<TlsListener>,
    gc: tokio::task::JoinHandle<()>,
}

impl Gateway {
    /// Compose the core and bring up every configured listener.
    pub async fn start(config: GatewayConfig) -> Result<Self> {
        let ctx = GatewayContext::new(config).await?;
        let gc = ctx.registry.spawn_gc();
        let mut listeners = Vec::with_capacity(ctx.config.listeners.len());
        for lcfg in &ctx.config.listeners {
            listeners.push(TlsListener::bind(ctx.clone(), lcfg).await?);
        }
        Ok(Self { ctx, listeners, gc })
    }

    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.local_addr).collect()
    }

    /// Orderly shutdown: stop accepting, close every session, cancel GC.
    /// Connection tasks send their close frames as they unwind.
    pub async fn stop(self) {
        info!("stopping gateway");
        for listener in &self.listeners {
            listener.shutdown();
        }
        self.ctx.registry.shut_down_all();
        self.gc.abort();
        info!("gateway stopped");
    }
}
