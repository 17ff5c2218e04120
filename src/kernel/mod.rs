//! Kernel - the per-process owner of every mesh subsystem.
//!
//! The Kernel owns the component table, discovery client, connection pool,
//! router and lock service, and runs the three background loops (RPC server,
//! liveness publisher, pool refresher). Components never see the Kernel
//! itself; they get a cheap [`KernelHandle`] at load time.
//!
//! ```text
//!                       ┌───────────────────────────────────────┐
//!   Router::call ─────→ │  Component table ── local dispatch    │
//!                       │        │ miss                         │
//!                       │        ▼                              │
//!                       │  Connection pool ── RPC client ───────┼──→ peer
//!                       │        │                              │
//!                       │  Discovery ←── Publisher (batched)    │
//!                       │        │                              │
//!                       │  Lock service ── StoreMutex           │
//!                       └────────┼──────────────────────────────┘
//!                                ▼
//!                         shared KvStore
//! ```

pub mod components;
pub mod discovery;
pub mod lock;
pub mod pool;
pub mod recovery;
pub mod router;

use std::fmt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ipc::{Connector, RpcServer, TcpConnector};
use crate::store::{KvStore, MemoryStore};
use crate::types::{ComponentSettings, Config, Error, Result};
use components::{Component, ComponentRecord, ComponentTable};
use discovery::{Discovery, Publisher};
use lock::{DistributedMutex, LockService, StoreMutex};
use pool::ConnectionPool;
use router::Router;

/// What a component gets to reach the rest of the mesh.
#[derive(Debug, Clone)]
pub struct KernelHandle {
    router: Arc<Router>,
    locks: LockService,
}

impl KernelHandle {
    pub fn new(router: Arc<Router>, locks: LockService) -> Self {
        Self { router, locks }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn locks(&self) -> &LockService {
        &self.locks
    }
}

/// Assembles a [`Kernel`] from config, collaborators and components.
pub struct KernelBuilder {
    config: Config,
    store: Option<Arc<dyn KvStore>>,
    connector: Option<Arc<dyn Connector>>,
    lock_backend: Option<Arc<dyn DistributedMutex>>,
    settings: ComponentSettings,
    components: Vec<(String, Box<dyn Component>)>,
}

impl fmt::Debug for KernelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.components.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("KernelBuilder")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("components", &names)
            .finish()
    }
}

impl KernelBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            connector: None,
            lock_backend: None,
            settings: ComponentSettings::new(),
            components: Vec::new(),
        }
    }

    /// Shared store for discovery and locks. Defaults to a private
    /// [`MemoryStore`], which only makes sense for a single process.
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn lock_backend(mut self, backend: Arc<dyn DistributedMutex>) -> Self {
        self.lock_backend = Some(backend);
        self
    }

    /// Flattened settings handed to every component's `load`.
    pub fn settings(mut self, settings: ComponentSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Add a component to load under `name`, in registration order.
    pub fn component(mut self, name: impl Into<String>, component: impl Component) -> Self {
        let component: Box<dyn Component> = Box::new(component);
        self.components.push((name.into(), component));
        self
    }

    /// Bind the listener, wire the subsystems and load every component.
    ///
    /// Nothing runs in the background until [`Kernel::start`].
    pub async fn build(self) -> Result<Kernel> {
        self.config.validate()?;

        let listener = TcpListener::bind(&self.config.server.listen_addr).await?;
        let endpoint = match &self.config.server.advertise_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => listener.local_addr()?.to_string(),
        };

        let store: Arc<dyn KvStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TcpConnector::new(self.config.transport.clone())),
        };
        let lock_backend: Arc<dyn DistributedMutex> = match self.lock_backend {
            Some(backend) => backend,
            None => Arc::new(StoreMutex::new(
                store.clone(),
                self.config.lock.key_prefix.clone(),
            )),
        };

        let discovery = Discovery::new(store, self.config.registry.ttl);
        let pool = Arc::new(ConnectionPool::new(discovery.clone(), connector));
        let table = Arc::new(ComponentTable::new());
        let router = Arc::new(Router::new(table.clone(), pool.clone(), endpoint.clone()));
        let locks = LockService::new(lock_backend, self.config.lock.clone());
        let handle = KernelHandle::new(router, locks);

        for (name, component) in self.components {
            table
                .load(component, &name, &self.settings, &endpoint, &handle)
                .await?;
        }

        Ok(Kernel {
            config: self.config,
            endpoint,
            listener: Mutex::new(Some(listener)),
            table,
            discovery,
            pool,
            handle,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// One process's view of the mesh.
#[derive(Debug)]
pub struct Kernel {
    config: Config,
    endpoint: String,
    listener: Mutex<Option<TcpListener>>,
    table: Arc<ComponentTable>,
    discovery: Discovery,
    pool: Arc<ConnectionPool>,
    handle: KernelHandle,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Kernel {
    pub fn builder(config: Config) -> KernelBuilder {
        KernelBuilder::new(config)
    }

    /// Start serving, publishing liveness and refreshing the pool.
    pub async fn start(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::server("kernel already started"))?;

        let server = RpcServer::new(
            self.table.clone(),
            self.config.transport.clone(),
            self.cancel.child_token(),
        );
        let server_task = tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                tracing::error!("RPC server stopped: {}", e);
            }
        });

        let publisher = Publisher::new(
            self.discovery.clone(),
            self.table.clone(),
            self.config.registry.publish_interval,
        );
        let publisher_task = publisher.spawn(self.cancel.child_token());

        let refresher_task = self
            .pool
            .clone()
            .spawn_refresher(self.config.pool.refresh_interval, self.cancel.child_token());

        self.tasks
            .lock()
            .await
            .extend([server_task, publisher_task, refresher_task]);

        let records = self.table.records().await;
        tracing::info!(
            endpoint = %self.endpoint,
            components = records.len(),
            open = records.iter().filter(|r| r.is_open).count(),
            "kernel started"
        );
        Ok(())
    }

    /// Publish every open component right now instead of waiting for the
    /// next publisher tick.
    pub async fn publish_now(&self) -> Result<usize> {
        let records = self.table.open_records().await;
        self.discovery.publish_all(&records).await
    }

    /// Stop the background loops and close every pooled connection.
    ///
    /// Liveness entries are not deleted; they lapse within one TTL.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("kernel task ended abnormally: {}", e);
            }
        }
        self.pool.close_all().await;
        tracing::info!(endpoint = %self.endpoint, "kernel stopped");
    }

    /// Endpoint this process advertises to discovery.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn handle(&self) -> &KernelHandle {
        &self.handle
    }

    pub fn router(&self) -> &Arc<Router> {
        self.handle.router()
    }

    pub fn locks(&self) -> &LockService {
        self.handle.locks()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub async fn components(&self) -> Vec<ComponentRecord> {
        self.table.records().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::types::{CallContext, LockConfig, Payload, TransportConfig};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Handle over a private store, for loading components in unit tests.
    pub(crate) fn handle_for_tests() -> KernelHandle {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let discovery = Discovery::new(store.clone(), Duration::from_secs(1));
        let pool = Arc::new(ConnectionPool::new(
            discovery,
            Arc::new(TcpConnector::new(TransportConfig::default())),
        ));
        let router = Arc::new(Router::new(
            Arc::new(ComponentTable::new()),
            pool,
            "127.0.0.1:0",
        ));
        let locks = LockService::new(
            Arc::new(StoreMutex::new(store, "lock:")),
            LockConfig::default(),
        );
        KernelHandle::new(router, locks)
    }

    /// Component that answers every method with an empty payload.
    pub(crate) struct Nop;

    #[async_trait]
    impl Component for Nop {
        async fn dispatch(
            &self,
            _method: &str,
            _request: Payload,
            _ctx: &mut CallContext,
        ) -> Result<Payload> {
            Ok(Payload::unit())
        }
    }
}
