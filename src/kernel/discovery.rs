//! Liveness-based service discovery.
//!
//! Every open component instance is represented by one short-TTL entry in the
//! shared store, keyed `<name>_<endpoint>`. Entries are never extended, only
//! rewritten by the publisher loop; a crashed process simply stops rewriting
//! and its entries lapse within one TTL.

use rand::seq::IteratorRandom;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::components::{ComponentRecord, ComponentTable};
use crate::store::KvStore;
use crate::types::{Error, Result};

/// Constant value stored under every liveness key.
pub const LIVENESS_SENTINEL: &str = "1";

/// Registry key for one instance of `name` at `endpoint`.
pub fn liveness_key(name: &str, endpoint: &str) -> String {
    format!("{}_{}", name, endpoint)
}

/// Reader and writer of liveness entries.
#[derive(Debug, Clone)]
pub struct Discovery {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl Discovery {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Write or refresh the liveness entry for one instance.
    pub async fn publish(&self, name: &str, endpoint: &str) -> Result<()> {
        self.store
            .set_with_ttl(&liveness_key(name, endpoint), LIVENESS_SENTINEL, self.ttl)
            .await
    }

    /// Refresh every open record in one atomic batch. Closed records are skipped.
    pub async fn publish_all(&self, records: &[ComponentRecord]) -> Result<usize> {
        let entries: Vec<(String, String)> = records
            .iter()
            .filter(|r| r.is_open)
            .map(|r| (liveness_key(&r.name, &r.endpoint), LIVENESS_SENTINEL.to_string()))
            .collect();
        if entries.is_empty() {
            return Ok(0);
        }
        self.store.set_many_with_ttl(&entries, self.ttl).await?;
        Ok(entries.len())
    }

    /// Every live endpoint for `name`.
    pub async fn find_all(&self, name: &str) -> Result<BTreeSet<String>> {
        let prefix = format!("{}_", name);
        let keys = self.store.keys_with_prefix(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|key| parse_key(key))
            .filter(|(n, _)| *n == name)
            .map(|(_, endpoint)| endpoint.to_string())
            .collect())
    }

    /// One live endpoint for `name`, chosen uniformly at random.
    pub async fn find_one(&self, name: &str) -> Result<String> {
        let endpoints = self.find_all(name).await?;
        endpoints
            .into_iter()
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| Error::not_found(format!("no live endpoint for {}", name)))
    }

    /// Whether `endpoint` currently has a live entry for `name`.
    pub async fn is_live(&self, name: &str, endpoint: &str) -> Result<bool> {
        Ok(self
            .store
            .get(&liveness_key(name, endpoint))
            .await?
            .is_some())
    }
}

/// Split a liveness key into (name, endpoint).
///
/// Endpoints are `host:port` and never contain `_`, while component names
/// may (shard suffixes), so the split is on the last underscore.
fn parse_key(key: &str) -> Option<(&str, &str)> {
    key.rsplit_once('_')
}

/// Periodic batched publisher for the open components of one process.
#[derive(Debug)]
pub struct Publisher {
    discovery: Discovery,
    table: Arc<ComponentTable>,
    interval: Duration,
}

impl Publisher {
    pub fn new(discovery: Discovery, table: Arc<ComponentTable>, interval: Duration) -> Self {
        Self {
            discovery,
            table,
            interval,
        }
    }

    /// Publish every open component once.
    pub async fn publish_once(&self) -> Result<usize> {
        let records = self.table.open_records().await;
        self.discovery.publish_all(&records).await
    }

    /// Run the publish loop until `cancel` fires. The first publish is immediate.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("liveness publisher stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.publish_once().await {
                            tracing::warn!("liveness publish failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
