//! Connection pool: one RPC channel per (component, endpoint) pair.
//!
//! Connections are created lazily by the first call needing one and
//! reconciled against discovery by [`ConnectionPool::refresh`], which is the
//! only place dead peers are pruned. The pool map is only locked for
//! lookups and inserts. Dials and discovery queries run outside it, and a
//! per-pair gate keeps two callers from dialing the same pair at once.
//!
//! A connection the peer is retiring (`Idle`) is dropped from the pool but
//! never closed here: calls already in flight on it finish, and the channel
//! shuts down once its last caller lets go of it.

use rand::seq::IteratorRandom;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::discovery::Discovery;
use crate::ipc::{Channel, Connector, ConnectivityState};
use crate::types::{Error, Result};

/// A pooled channel to one endpoint of one component.
#[derive(Debug, Clone)]
pub struct PooledConnection {
    pub component: String,
    pub endpoint: String,
    pub channel: Arc<dyn Channel>,
}

impl PooledConnection {
    /// Process-unique identity of the underlying connection.
    pub fn id(&self) -> u64 {
        self.channel.id()
    }

    pub fn state(&self) -> ConnectivityState {
        self.channel.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectivityState::Ready
    }

    /// Let go of a connection that left the pool.
    fn release(self) {
        if self.state() == ConnectivityState::Idle {
            tracing::debug!(
                component = %self.component,
                endpoint = %self.endpoint,
                conn_id = self.id(),
                "released draining connection"
            );
        } else {
            self.channel.close();
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub evicted: usize,
    pub opened: usize,
}

/// Point-in-time view of one pooled connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub component: String,
    pub endpoint: String,
    pub connection_id: u64,
    pub state: String,
}

type ConnMap = HashMap<String, BTreeMap<String, PooledConnection>>;
type DialGates = HashMap<(String, String), Arc<Mutex<()>>>;

#[derive(Debug)]
pub struct ConnectionPool {
    discovery: Discovery,
    connector: Arc<dyn Connector>,
    conns: Mutex<ConnMap>,
    dial_gates: Mutex<DialGates>,
}

impl ConnectionPool {
    pub fn new(discovery: Discovery, connector: Arc<dyn Connector>) -> Self {
        Self {
            discovery,
            connector,
            conns: Mutex::new(HashMap::new()),
            dial_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// A ready connection to any endpoint of `component`, dialing one if needed.
    pub async fn get_or_create(&self, component: &str) -> Result<PooledConnection> {
        let existing = self.conns.lock().await.get(component).and_then(|by_endpoint| {
            by_endpoint
                .values()
                .filter(|c| c.is_ready())
                .choose(&mut rand::thread_rng())
                .cloned()
        });
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let endpoint = self.discovery.find_one(component).await.map_err(|e| match e {
            Error::NotFound(msg) | Error::Unavailable(msg) => Error::unavailable(msg),
            other => Error::unavailable(other.to_string()),
        })?;
        let (conn, _) = self.connect_pair(component, &endpoint).await?;
        Ok(conn)
    }

    /// A ready connection to one specific endpoint of `component`.
    ///
    /// Fails with `NotFound` when that endpoint is not currently live.
    pub async fn get_or_create_by_endpoint(
        &self,
        component: &str,
        endpoint: &str,
    ) -> Result<PooledConnection> {
        if !self.discovery.is_live(component, endpoint).await? {
            return Err(Error::not_found(format!(
                "{} is not live at {}",
                component, endpoint
            )));
        }
        if let Some(existing) = self.ready_at(component, endpoint).await {
            return Ok(existing);
        }
        let (conn, _) = self.connect_pair(component, endpoint).await?;
        Ok(conn)
    }

    async fn ready_at(&self, component: &str, endpoint: &str) -> Option<PooledConnection> {
        self.conns
            .lock()
            .await
            .get(component)
            .and_then(|by_endpoint| by_endpoint.get(endpoint))
            .filter(|c| c.is_ready())
            .cloned()
    }

    async fn dial_gate(&self, component: &str, endpoint: &str) -> Arc<Mutex<()>> {
        self.dial_gates
            .lock()
            .await
            .entry((component.to_string(), endpoint.to_string()))
            .or_default()
            .clone()
    }

    /// Ready connection for the pair, dialing under the pair's gate when
    /// none is pooled. The flag reports whether a dial happened.
    async fn connect_pair(
        &self,
        component: &str,
        endpoint: &str,
    ) -> Result<(PooledConnection, bool)> {
        let gate = self.dial_gate(component, endpoint).await;
        let _dialing = gate.lock().await;
        if let Some(existing) = self.ready_at(component, endpoint).await {
            return Ok((existing, false));
        }

        let channel = self.connector.connect(endpoint).await.map_err(|e| match e {
            Error::Unavailable(msg) => Error::unavailable(msg),
            other => Error::unavailable(format!("dial {} failed: {}", endpoint, other)),
        })?;
        let conn = PooledConnection {
            component: component.to_string(),
            endpoint: endpoint.to_string(),
            channel,
        };
        let replaced = self
            .conns
            .lock()
            .await
            .entry(component.to_string())
            .or_default()
            .insert(endpoint.to_string(), conn.clone());
        if let Some(old) = replaced {
            old.release();
        }
        tracing::debug!(
            component = %component,
            endpoint = %endpoint,
            conn_id = conn.id(),
            "pooled new connection"
        );
        Ok((conn, true))
    }

    /// Reconcile every known component against discovery.
    ///
    /// Connections whose endpoint is gone or which are no longer ready are
    /// evicted; at most one new connection is opened per missing live
    /// endpoint. Per-component discovery failures are logged and leave that
    /// component's connections untouched.
    pub async fn refresh(&self) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        let components: Vec<String> = self.conns.lock().await.keys().cloned().collect();

        for component in components {
            let live = match self.discovery.find_all(&component).await {
                Ok(live) => live,
                Err(e) => {
                    tracing::warn!(component = %component, "refresh skipped: {}", e);
                    continue;
                }
            };

            let (stale, missing) = {
                let mut conns = self.conns.lock().await;
                let by_endpoint = conns.entry(component.clone()).or_default();
                let stale_endpoints: Vec<String> = by_endpoint
                    .iter()
                    .filter(|(endpoint, conn)| !live.contains(*endpoint) || !conn.is_ready())
                    .map(|(endpoint, _)| endpoint.clone())
                    .collect();
                let stale: Vec<PooledConnection> = stale_endpoints
                    .iter()
                    .filter_map(|endpoint| by_endpoint.remove(endpoint))
                    .collect();
                let missing: Vec<String> = live
                    .iter()
                    .filter(|endpoint| !by_endpoint.contains_key(*endpoint))
                    .cloned()
                    .collect();
                (stale, missing)
            };

            for conn in stale {
                tracing::debug!(
                    component = %component,
                    endpoint = %conn.endpoint,
                    state = %conn.state(),
                    "evicting connection"
                );
                conn.release();
                summary.evicted += 1;
            }

            for endpoint in missing {
                match self.connect_pair(&component, &endpoint).await {
                    Ok((_, true)) => summary.opened += 1,
                    Ok((_, false)) => {}
                    Err(e) => {
                        tracing::debug!(component = %component, endpoint = %endpoint, "refresh dial failed: {}", e)
                    }
                }
            }
        }

        self.dial_gates
            .lock()
            .await
            .retain(|_, gate| Arc::strong_count(gate) > 1);

        if summary != RefreshSummary::default() {
            tracing::info!(
                evicted = summary.evicted,
                opened = summary.opened,
                "connection pool refreshed"
            );
        }
        summary
    }

    /// Drop the connection `conn_id` if it is still the pooled one for the
    /// pair. A newer connection that replaced it is left alone.
    pub async fn evict(&self, component: &str, endpoint: &str, conn_id: u64) -> bool {
        let removed = {
            let mut conns = self.conns.lock().await;
            let Some(by_endpoint) = conns.get_mut(component) else {
                return false;
            };
            if by_endpoint.get(endpoint).map(PooledConnection::id) != Some(conn_id) {
                return false;
            }
            by_endpoint.remove(endpoint)
        };
        match removed {
            Some(conn) => {
                conn.release();
                true
            }
            None => false,
        }
    }

    /// Register interest in `component` so refresh pre-dials its endpoints.
    pub async fn watch(&self, component: &str) {
        self.conns
            .lock()
            .await
            .entry(component.to_string())
            .or_default();
    }

    pub async fn stats(&self) -> Vec<ConnectionStats> {
        let conns = self.conns.lock().await;
        let mut stats: Vec<ConnectionStats> = conns
            .values()
            .flat_map(|by_endpoint| by_endpoint.values())
            .map(|c| ConnectionStats {
                component: c.component.clone(),
                endpoint: c.endpoint.clone(),
                connection_id: c.id(),
                state: c.state().to_string(),
            })
            .collect();
        stats.sort_by(|a, b| (&a.component, &a.endpoint).cmp(&(&b.component, &b.endpoint)));
        stats
    }

    /// Close every pooled connection.
    pub async fn close_all(&self) {
        let mut conns = self.conns.lock().await;
        for conn in conns.values().flat_map(|by_endpoint| by_endpoint.values()) {
            conn.channel.close();
        }
        conns.clear();
    }

    /// Run [`refresh`](Self::refresh) on a fixed period until `cancel` fires.
    pub fn spawn_refresher(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.refresh().await;
                    }
                }
            }
        })
    }
}
