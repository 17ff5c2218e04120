//! Distributed lock and the reentrant lock-stack protocol.
//!
//! The real mutex is a lease on a key in the shared store. On top of it,
//! [`LockService::acquire_for_context`] makes the lock name the unit of
//! reentrancy within one call chain: the first acquisition of a name takes the
//! real lease, every nested one only pushes a virtual record onto the
//! context's lock stack. Releases must unwind in strict LIFO order and only
//! the release of the real record touches the lease.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::store::KvStore;
use crate::types::{CallContext, Error, LockConfig, LockRecord, Result};

/// Lease-based mutual exclusion primitive.
#[async_trait]
pub trait DistributedMutex: Send + Sync + fmt::Debug + 'static {
    /// Try once to take `name` for `token`. Returns whether the lease was granted.
    async fn try_acquire(&self, name: &str, token: &str, lease: Duration) -> Result<bool>;

    /// Give `name` back if `token` still owns it. Returns whether anything was released.
    async fn release(&self, name: &str, token: &str) -> Result<bool>;
}

/// [`DistributedMutex`] over the shared [`KvStore`].
#[derive(Debug, Clone)]
pub struct StoreMutex {
    store: Arc<dyn KvStore>,
    key_prefix: String,
}

impl StoreMutex {
    pub fn new(store: Arc<dyn KvStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }
}

#[async_trait]
impl DistributedMutex for StoreMutex {
    async fn try_acquire(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        self.store.set_if_absent(&self.key(name), token, lease).await
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool> {
        self.store.delete_if_equals(&self.key(name), token).await
    }
}

/// Proof of a held real lock. Only real acquisitions produce one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    name: String,
    token: String,
}

impl LockHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[derive(Debug, Clone)]
pub struct LockService {
    backend: Arc<dyn DistributedMutex>,
    config: LockConfig,
}

impl LockService {
    pub fn new(backend: Arc<dyn DistributedMutex>, config: LockConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire the real lock, retrying up to `max_retries` times.
    ///
    /// Fails with `LockUnavailable` when the last attempt hit a backend error
    /// and `LockTimeout` when the lock simply stayed held.
    pub async fn acquire(&self, name: &str) -> Result<LockHandle> {
        let token = Uuid::new_v4().to_string();
        let mut last_error: Option<Error> = None;

        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            match self
                .backend
                .try_acquire(name, &token, self.config.lease)
                .await
            {
                Ok(true) => {
                    tracing::debug!(lock = %name, attempts = attempt + 1, "lock acquired");
                    return Ok(LockHandle {
                        name: name.to_string(),
                        token,
                    });
                }
                Ok(false) => last_error = None,
                Err(e) => {
                    tracing::debug!(lock = %name, attempt, "lock backend error: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(Error::lock_unavailable(format!(
                "lock {} backend failed: {}",
                name, e
            ))),
            None => Err(Error::lock_timeout(format!(
                "lock {} still held after {} attempts",
                name, self.config.max_retries
            ))),
        }
    }

    /// Release a real lock. Returns `false` when the lease had already lapsed
    /// or been taken over.
    pub async fn release(&self, handle: &LockHandle) -> Result<bool> {
        let released = self.backend.release(&handle.name, &handle.token).await?;
        if !released {
            tracing::warn!(lock = %handle.name, "lock lease was gone at release");
        }
        Ok(released)
    }

    /// Acquire `name` on behalf of `owner` within the call chain of `ctx`.
    ///
    /// If any record for `name` is already on the stack the acquisition is
    /// virtual and returns `None`. Otherwise the real lock is taken and its
    /// handle returned. The stack is untouched on failure.
    pub async fn acquire_for_context(
        &self,
        name: &str,
        ctx: &mut CallContext,
        owner: &str,
    ) -> Result<Option<LockHandle>> {
        if ctx.lock_stack.holds(name) {
            ctx.lock_stack.push(LockRecord::new(owner, name, false));
            tracing::trace!(lock = %name, owner = %owner, "reentrant acquire");
            return Ok(None);
        }

        let handle = self.acquire(name).await?;
        ctx.lock_stack.push(LockRecord::new(owner, name, true));
        Ok(Some(handle))
    }

    /// Release `name` on behalf of `owner`.
    ///
    /// The top of the stack must be `owner:name` and `handle`, when given,
    /// must belong to `name`. A mismatch is logged as a protocol violation
    /// and nothing is popped or released. Backend release failures are
    /// logged; the record is popped regardless.
    pub async fn release_for_context(
        &self,
        name: &str,
        ctx: &mut CallContext,
        owner: &str,
        handle: Option<LockHandle>,
    ) {
        if let Some(foreign) = handle.as_ref().filter(|h| h.name() != name) {
            tracing::error!(
                owner = %owner,
                lock = %name,
                handle_lock = %foreign.name(),
                stack = %ctx.lock_stack,
                "lock protocol violation: release handle belongs to another lock"
            );
            return;
        }

        let record = match ctx.lock_stack.pop_matching(owner, name) {
            Ok(record) => record,
            Err(top) => {
                tracing::error!(
                    owner = %owner,
                    lock = %name,
                    top = ?top.map(|r| r.to_string()),
                    stack = %ctx.lock_stack,
                    user_id = %ctx.user_id,
                    "lock protocol violation: release does not match top of lock stack"
                );
                return;
            }
        };

        if !record.is_real_lock {
            return;
        }
        let Some(handle) = handle else {
            tracing::error!(
                owner = %owner,
                lock = %name,
                "lock protocol violation: real lock released without its handle"
            );
            return;
        };
        if let Err(e) = self.release(&handle).await {
            tracing::warn!(lock = %name, "lock release failed, lease will expire: {}", e);
        }
    }

    /// Run `body` while holding `name` for `owner`, releasing afterwards even
    /// when `body` fails.
    pub async fn with_lock<T, F>(
        &self,
        name: &str,
        ctx: &mut CallContext,
        owner: &str,
        body: F,
    ) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut CallContext) -> BoxFuture<'a, Result<T>>,
    {
        let handle = self.acquire_for_context(name, ctx, owner).await?;
        let result = body(ctx).await;
        self.release_for_context(name, ctx, owner, handle).await;
        result
    }
}
