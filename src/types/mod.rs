//! Core types for the mesh kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **Errors**: the kernel error taxonomy with thiserror derives
//! - **Config**: configuration structures for registry, pool, transport and locks
//! - **Context**: the per-request call context and its lock stack
//! - **Payload**: self-describing request/reply bodies

mod config;
mod context;
mod errors;
mod payload;

pub use config::{
    ComponentSettings, Config, LockConfig, ObservabilityConfig, PoolConfig, RegistryConfig,
    ServerConfig, TransportConfig,
};
pub use context::{CallContext, LockRecord, LockStack};
pub use errors::{Error, ErrorMessage, Result, CODE_SERVER_ERROR};
pub use payload::{Payload, WirePayload};
