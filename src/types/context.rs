//! Per-request call context.
//!
//! A `CallContext` is created once at the system boundary for each inbound
//! request and threaded by `&mut` through every call in that chain. It owns
//! the lock stack used by the reentrant lock protocol; the stack must never be
//! copied apart from the context it belongs to.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One entry of the lock stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Component that performed this acquisition.
    pub owner_component: String,
    pub lock_name: String,
    /// True when this record holds the backing distributed mutex.
    pub is_real_lock: bool,
}

impl LockRecord {
    pub fn new(owner_component: impl Into<String>, lock_name: impl Into<String>, is_real_lock: bool) -> Self {
        Self {
            owner_component: owner_component.into(),
            lock_name: lock_name.into(),
            is_real_lock,
        }
    }
}

impl fmt::Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_real_lock { "real" } else { "virtual" };
        write!(f, "{}:{}({})", self.owner_component, self.lock_name, kind)
    }
}

/// Strict LIFO stack of lock records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStack {
    records: Vec<LockRecord>,
}

impl LockStack {
    /// Whether any record in the chain already covers `lock_name`,
    /// regardless of which component owns it.
    pub fn holds(&self, lock_name: &str) -> bool {
        self.records.iter().rev().any(|r| r.lock_name == lock_name)
    }

    pub fn push(&mut self, record: LockRecord) {
        self.records.push(record);
    }

    pub fn top(&self) -> Option<&LockRecord> {
        self.records.last()
    }

    /// Pop the topmost record only if it matches `(owner_component, lock_name)`.
    /// A mismatch leaves the stack untouched and returns `Err` with the
    /// current top for reporting.
    pub fn pop_matching(
        &mut self,
        owner_component: &str,
        lock_name: &str,
    ) -> std::result::Result<LockRecord, Option<LockRecord>> {
        let top_matches = self
            .records
            .last()
            .is_some_and(|top| top.owner_component == owner_component && top.lock_name == lock_name);
        if top_matches {
            self.records.pop().ok_or(None)
        } else {
            Err(self.records.last().cloned())
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records holding the real mutex.
    pub fn real_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_real_lock).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LockRecord> {
        self.records.iter()
    }
}

impl fmt::Display for LockStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", record)?;
        }
        write!(f, "]")
    }
}

/// Caller identity plus the lock stack, carried on every call.
///
/// Identity fields are opaque to the kernel; they are forwarded unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    pub user_id: String,
    pub conn_id: String,
    /// Endpoint of the process holding the client's connection.
    pub conn_host: String,
    pub roles: Vec<String>,
    pub lock_stack: LockStack,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a request arriving from a connected client.
    pub fn for_user(user_id: impl Into<String>, conn_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conn_id: conn_id.into(),
            ..Self::default()
        }
    }

    pub fn with_conn_host(mut self, conn_host: impl Into<String>) -> Self {
        self.conn_host = conn_host.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}
