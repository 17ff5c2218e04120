//! # Mesh Kernel - Component Invocation Layer for Sharded Game Backends
//!
//! Rust implementation of the mesh kernel providing:
//! - Location-transparent calls between named components, in-process or over TCP
//! - Liveness-based discovery on a shared TTL store
//! - A connection pool with one channel per (component, endpoint) pair
//! - A reentrant distributed lock driven by a per-request lock stack
//! - Panic recovery at every dispatch boundary
//!
//! ## Architecture
//!
//! Each process builds one [`Kernel`](kernel::Kernel) that owns all mesh state:
//! ```text
//!                     ┌──────────────────────────────────┐
//!   inbound request → │             Kernel               │
//!    (CallContext)    │  ┌─────────┐     ┌────────────┐  │
//!                     │  │ Router  │ ──→ │ Components │  │
//!                     │  └────┬────┘     └────────────┘  │
//!                     │  ┌────┴────┐     ┌────────────┐  │
//!                     │  │  Pool   │ ──→ │ Discovery  │  │
//!                     │  └────┬────┘     └────────────┘  │
//!                     │  ┌────┴────┐     ┌────────────┐  │
//!                     │  │RPC (ipc)│     │LockService │  │
//!                     │  └─────────┘     └────────────┘  │
//!                     └──────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod ipc;
pub mod kernel;
pub mod store;
pub mod types;

// Internal utilities
pub mod observability;

pub use kernel::components::{Component, ComponentRecord};
pub use kernel::{Kernel, KernelBuilder, KernelHandle};
pub use types::{CallContext, Config, Error, Payload, Result};
