//! RPC client: one multiplexed TCP connection per remote endpoint.
//!
//! Each connection runs three background tasks: a writer draining an
//! outbound frame queue, a reader resolving pending calls by frame id, and a
//! keep-alive loop probing the peer. Calls are bounded by a fixed deadline;
//! a timed-out call stops waiting locally while the peer may still finish.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::ipc::codec::{
    read_frame, write_frame, Frame, MSG_ERROR, MSG_GOAWAY, MSG_PING, MSG_PONG, MSG_REFUSED,
    MSG_REQUEST, MSG_RESPONSE,
};
use crate::ipc::envelope::Envelope;
use crate::types::{Error, Result, TransportConfig};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connectivity of a pooled connection. Only `Ready` connections are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectivityState {
    /// Peer asked us to stop sending; in-flight calls may still complete.
    Idle = 0,
    Connecting = 1,
    Ready = 2,
    /// Keep-alive failed or the peer vanished.
    TransientFailure = 3,
    /// Closed locally.
    Shutdown = 4,
}

impl ConnectivityState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectivityState::Idle,
            1 => ConnectivityState::Connecting,
            2 => ConnectivityState::Ready,
            3 => ConnectivityState::TransientFailure,
            _ => ConnectivityState::Shutdown,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Idle => "idle",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Ready => "ready",
            ConnectivityState::TransientFailure => "transient_failure",
            ConnectivityState::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// An established channel to one remote endpoint.
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    /// Process-unique identity of this connection.
    fn id(&self) -> u64;

    fn endpoint(&self) -> &str;

    fn state(&self) -> ConnectivityState;

    /// Exchange one envelope with the peer, bounded by the call deadline.
    async fn send(&self, envelope: Envelope) -> Result<Envelope>;

    /// Tear the channel down. Pending calls fail with `Unavailable`.
    fn close(&self);
}

/// Dials channels. The pool depends on this seam rather than on TCP directly.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Channel>>;
}

/// Default connector: msgpack frames over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: TransportConfig,
}

impl TcpConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Channel>> {
        let conn: Arc<dyn Channel> = RpcConnection::connect(endpoint, &self.config).await?;
        Ok(conn)
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<Frame>>;

/// Multiplexed client connection.
pub struct RpcConnection {
    id: u64,
    endpoint: String,
    next_frame_id: AtomicU64,
    pending: Arc<Mutex<PendingMap>>,
    outbound: mpsc::Sender<Frame>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    call_timeout: Duration,
}

impl fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl RpcConnection {
    /// Dial `endpoint` and start the connection tasks.
    pub async fn connect(endpoint: &str, config: &TransportConfig) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| {
                Error::unavailable(format!(
                    "dial {} timed out after {:?}",
                    endpoint, config.connect_timeout
                ))
            })?
            .map_err(|e| Error::unavailable(format!("dial {} failed: {}", endpoint, e)))?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(256);

        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint: endpoint.to_string(),
            next_frame_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outbound,
            state: Arc::new(AtomicU8::new(ConnectivityState::Connecting as u8)),
            cancel: CancellationToken::new(),
            call_timeout: config.call_timeout,
        });

        tokio::spawn(write_loop(writer, outbound_rx, conn.cancel.clone()));
        tokio::spawn(read_loop(
            reader,
            config.max_frame_bytes,
            conn.pending.clone(),
            conn.state.clone(),
            conn.cancel.clone(),
            conn.endpoint.clone(),
        ));
        tokio::spawn(keepalive_loop(
            Arc::downgrade(&conn),
            config.keepalive_interval,
            config.keepalive_timeout,
        ));

        conn.set_state(ConnectivityState::Ready);
        tracing::debug!(endpoint = %conn.endpoint, conn_id = conn.id, "rpc connection ready");
        Ok(conn)
    }

    fn set_state(&self, state: ConnectivityState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Stop handing this connection out; calls already in flight continue.
    fn retire(&self) {
        retire(&self.state);
    }

    /// Send one frame and wait for the frame carrying the same id.
    async fn round_trip(&self, kind: u8, payload: Vec<u8>, deadline: Duration) -> Result<Frame> {
        let id = self.next_frame_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outbound.send(Frame::new(kind, id, payload)).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::unavailable(format!(
                "connection to {} is closed",
                self.endpoint
            )));
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(Error::unavailable(format!(
                "connection to {} closed while waiting for reply",
                self.endpoint
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::timeout(format!(
                    "call to {} exceeded {:?}",
                    self.endpoint, deadline
                )))
            }
        }
    }
}

#[async_trait]
impl Channel for RpcConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn send(&self, envelope: Envelope) -> Result<Envelope> {
        let state = self.state();
        if state != ConnectivityState::Ready {
            return Err(Error::unavailable(format!(
                "connection to {} is {}",
                self.endpoint, state
            )));
        }

        let bytes = envelope.encode()?;
        let frame = self.round_trip(MSG_REQUEST, bytes, self.call_timeout).await?;
        match frame.kind {
            MSG_RESPONSE => Envelope::decode(&frame.payload),
            MSG_REFUSED => {
                self.retire();
                Err(Error::unavailable(format!(
                    "{} refused the request: {}",
                    self.endpoint,
                    String::from_utf8_lossy(&frame.payload)
                )))
            }
            MSG_ERROR => Err(Error::server(String::from_utf8_lossy(&frame.payload).into_owned())),
            other => Err(Error::server(format!(
                "unexpected frame kind 0x{:02X} from {}",
                other, self.endpoint
            ))),
        }
    }

    fn close(&self) {
        self.set_state(ConnectivityState::Shutdown);
        self.cancel.cancel();
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn retire(state: &AtomicU8) {
    let _ = state.compare_exchange(
        ConnectivityState::Ready as u8,
        ConnectivityState::Idle as u8,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => {
                let Some(frame) = next else { break };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::debug!("rpc write failed: {}", e);
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    max_frame_bytes: u32,
    pending: Arc<Mutex<PendingMap>>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    endpoint: String,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader, max_frame_bytes) => frame,
        };

        match frame {
            Ok(Some(frame)) if frame.kind == MSG_GOAWAY => {
                tracing::debug!(endpoint = %endpoint, "peer retiring connection");
                retire(&state);
            }
            Ok(Some(frame)) => {
                let waiter = pending.lock().await.remove(&frame.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => tracing::debug!(
                        endpoint = %endpoint,
                        id = frame.id,
                        "dropping reply for abandoned call"
                    ),
                }
            }
            Ok(None) => {
                tracing::debug!(endpoint = %endpoint, "peer closed connection");
                break;
            }
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, "rpc read failed: {}", e);
                break;
            }
        }
    }

    let current = ConnectivityState::from_u8(state.load(Ordering::SeqCst));
    if current != ConnectivityState::Shutdown {
        state.store(ConnectivityState::TransientFailure as u8, Ordering::SeqCst);
    }
    cancel.cancel();
    // Dropping the senders fails every waiting call with Unavailable.
    pending.lock().await.clear();
}

async fn keepalive_loop(
    conn: std::sync::Weak<RpcConnection>,
    interval: Duration,
    timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let cancel = match conn.upgrade() {
            Some(c) => c.cancel.clone(),
            None => return,
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(c) = conn.upgrade() else { return };
        if c.state() != ConnectivityState::Ready {
            continue;
        }
        match c.round_trip(MSG_PING, Vec::new(), timeout).await {
            Ok(frame) if frame.kind == MSG_PONG => {}
            Ok(frame) => tracing::debug!(
                endpoint = %c.endpoint,
                kind = frame.kind,
                "unexpected keep-alive answer"
            ),
            Err(e) => {
                tracing::warn!(endpoint = %c.endpoint, "keep-alive failed: {}", e);
                c.set_state(ConnectivityState::TransientFailure);
                c.cancel.cancel();
                return;
            }
        }
    }
}
