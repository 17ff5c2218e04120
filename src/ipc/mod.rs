//! TCP+msgpack RPC transport layer.
//!
//! Length-prefixed frames carry [`Envelope`]s between processes. The client
//! side multiplexes calls over one connection per endpoint; the server side
//! dispatches each request to the local component table.

pub mod client;
pub mod codec;
pub mod envelope;
pub mod server;

pub use client::{Channel, Connector, ConnectivityState, RpcConnection, TcpConnector};
pub use envelope::Envelope;
pub use server::RpcServer;
