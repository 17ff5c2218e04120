//! In-memory TTL store.
//!
//! Clones share the same map, so several kernels in one test process see one
//! "shared" store. Expiry uses `tokio::time::Instant`, which makes TTL
//! behaviour testable under a paused clock.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::KvStore;
use crate::types::{Error, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process [`KvStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, Entry>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable. Every operation fails with
    /// `Unavailable` while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live entries.
    pub async fn live_len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::unavailable("store offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check_online()?;
        let expires_at = Instant::now() + ttl;
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_many_with_ttl(&self, entries: &[(String, String)], ttl: Duration) -> Result<()> {
        self.check_online()?;
        let expires_at = Instant::now() + ttl;
        let mut map = self.entries.lock().await;
        for (key, value) in entries {
            map.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    expires_at,
                },
            );
        }
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_online()?;
        let now = Instant::now();
        let mut map = self.entries.lock().await;
        map.retain(|_, e| e.is_live(now));
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_online()?;
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .await
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut map = self.entries.lock().await;
        if map.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut map = self.entries.lock().await;
        match map.get(key) {
            Some(e) if e.is_live(now) && e.value == value => {
                map.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
