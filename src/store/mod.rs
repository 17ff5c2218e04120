//! Shared key-value store boundary.
//!
//! The registry and the distributed lock both live on one TTL-capable store.
//! The kernel only needs set-with-expiry, prefix lookup, an atomic multi-write,
//! and the two conditional operations a lease-based mutex is built from.
//! [`MemoryStore`] is the in-process implementation; a networked store plugs
//! in behind the same trait.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::types::Result;

/// TTL key-value store shared by every process in the mesh.
#[async_trait]
pub trait KvStore: Send + Sync + fmt::Debug + 'static {
    /// Write `key` with an expiry, replacing any previous value and TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Write every entry with the same expiry as one atomic batch.
    async fn set_many_with_ttl(&self, entries: &[(String, String)], ttl: Duration) -> Result<()>;

    /// Live keys starting with `prefix`, in lexical order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Current value of a live key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `key` only when no live value exists. Returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only when its live value equals `value`. Returns whether it was deleted.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool>;
}
