//! TCP RPC server: accept loop and per-connection handler.
//!
//! Each accepted connection gets a reader task, a writer task and a control
//! loop. Requests are dispatched concurrently, one task per frame, and their
//! replies are written back tagged with the request's frame id.
//!
//! Connections are recycled: one that carried no requests for
//! `server_idle_timeout` is closed, and one older than `max_connection_age`
//! is sent GOAWAY, then closed once its in-flight calls finish or
//! `max_connection_age_grace` runs out.

use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ipc::codec::{
    read_frame, write_frame, Frame, MSG_ERROR, MSG_GOAWAY, MSG_PING, MSG_PONG, MSG_REFUSED,
    MSG_REQUEST, MSG_RESPONSE,
};
use crate::ipc::envelope::Envelope;
use crate::kernel::components::ComponentTable;
use crate::kernel::recovery::with_recovery_async;
use crate::types::{CallContext, Error, Payload, Result, TransportConfig, WirePayload};

/// RPC server exposing the local component table.
#[derive(Debug)]
pub struct RpcServer {
    table: Arc<ComponentTable>,
    config: TransportConfig,
    cancel: CancellationToken,
}

impl RpcServer {
    pub fn new(
        table: Arc<ComponentTable>,
        config: TransportConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            table,
            config,
            cancel,
        }
    }

    /// Accept connections on `listener` until cancelled.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let conn_semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        tracing::info!(
            "RPC server listening on {} (max_connections={})",
            listener.local_addr()?,
            self.config.max_connections,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("RPC server shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("accept failed: {}", e);
                            continue;
                        }
                    };

                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "Connection from {} rejected: at max_connections ({})",
                                peer,
                                self.config.max_connections,
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!("RPC connection from {} (active={})",
                        peer,
                        self.config.max_connections - conn_semaphore.available_permits(),
                    );
                    let table = self.table.clone();
                    let cancel = self.cancel.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, table, cancel, config, permit).await {
                            tracing::warn!("Connection from {} error: {}", peer, e);
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Decode a request envelope, run it against the table and build the reply.
///
/// Never fails: every problem becomes an error reply. The returned reply
/// carries the context as the handler left it.
pub async fn handle_request(table: &ComponentTable, bytes: &[u8]) -> Envelope {
    let request = match Envelope::decode(bytes) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("dropping undecodable request: {}", e);
            return Envelope::undecodable(&e);
        }
    };

    let operation = format!("{}.{}", request.component, request.method);
    let mut ctx = request.context.clone();
    let result = with_recovery_async(dispatch_envelope(table, &request, &mut ctx), &operation).await;
    match result {
        Ok(wire) => request.reply(wire, ctx),
        Err(e) => {
            tracing::debug!(operation = %operation, code = e.to_ipc_error_code(), "handler failed: {}", e);
            request.reply_error(&e, ctx)
        }
    }
}

async fn dispatch_envelope(
    table: &ComponentTable,
    request: &Envelope,
    ctx: &mut CallContext,
) -> Result<WirePayload> {
    let component = table.get(&request.component).await.ok_or_else(|| {
        Error::server(format!("component {} is not hosted here", request.component))
    })?;
    let payload = request
        .payload
        .clone()
        .map(Payload::from_wire)
        .ok_or_else(|| Error::server("request carried no payload"))?;
    let reply = component.dispatch(&request.method, payload, ctx).await?;
    reply.into_wire()
}

/// Handle a single TCP connection until it is idle, retired, or closed.
async fn handle_connection(
    stream: TcpStream,
    table: Arc<ComponentTable>,
    cancel: CancellationToken,
    config: TransportConfig,
    _permit: OwnedSemaphorePermit, // held for connection lifetime
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();

    let reader_stop = cancel.child_token();
    let writer_stop = cancel.child_token();
    let (inbound_tx, mut inbound) = mpsc::channel::<Frame>(64);
    let (outbound, outbound_rx) = mpsc::channel::<Frame>(256);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();

    tokio::spawn(read_loop(
        reader,
        config.max_frame_bytes,
        inbound_tx,
        reader_stop.clone(),
    ));
    tokio::spawn(write_loop(writer, outbound_rx, writer_stop.clone()));

    let age_deadline = Instant::now() + config.max_connection_age;
    let mut idle_deadline = Instant::now() + config.server_idle_timeout;
    let mut drain_deadline: Option<Instant> = None;
    let mut in_flight: usize = 0;

    loop {
        let draining = drain_deadline.is_some();
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(()) = done_rx.recv() => {
                in_flight -= 1;
                idle_deadline = Instant::now() + config.server_idle_timeout;
                if draining && in_flight == 0 {
                    tracing::debug!("retired connection drained");
                    break;
                }
            }
            _ = tokio::time::sleep_until(idle_deadline), if !draining && in_flight == 0 => {
                tracing::debug!("closing idle connection after {:?}", config.server_idle_timeout);
                break;
            }
            _ = tokio::time::sleep_until(age_deadline), if !draining => {
                tracing::debug!("connection reached max age, sending GOAWAY");
                if outbound.send(Frame::control(MSG_GOAWAY, 0)).await.is_err() {
                    break;
                }
                if in_flight == 0 {
                    break;
                }
                drain_deadline = Some(Instant::now() + config.max_connection_age_grace);
            }
            _ = sleep_until_opt(drain_deadline), if draining => {
                tracing::debug!(in_flight, "grace period over, closing retired connection");
                writer_stop.cancel();
                break;
            }
            next = inbound.recv() => {
                let Some(frame) = next else { break };
                match frame.kind {
                    MSG_PING => {
                        if outbound.send(Frame::control(MSG_PONG, frame.id)).await.is_err() {
                            break;
                        }
                    }
                    MSG_REQUEST if draining => {
                        tracing::debug!(id = frame.id, "refusing request on draining connection");
                        let reason = b"connection is draining, retry on a new connection".to_vec();
                        if outbound.send(Frame::new(MSG_REFUSED, frame.id, reason)).await.is_err() {
                            break;
                        }
                    }
                    MSG_REQUEST => {
                        in_flight += 1;
                        idle_deadline = Instant::now() + config.server_idle_timeout;
                        let table = table.clone();
                        let outbound = outbound.clone();
                        let done = done_tx.clone();
                        tokio::spawn(async move {
                            let reply = handle_request(&table, &frame.payload).await;
                            let _ = outbound.send(reply_frame(frame.id, &reply)).await;
                            let _ = done.send(());
                        });
                    }
                    other => {
                        let text = format!("Unexpected message type: 0x{:02X}", other);
                        if outbound.send(Frame::new(MSG_ERROR, frame.id, text.into_bytes())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    // Queued replies still flush; the writer exits once every sender is gone.
    reader_stop.cancel();
    drop(outbound);
    Ok(())
}

fn reply_frame(id: u64, reply: &Envelope) -> Frame {
    match reply.encode() {
        Ok(bytes) => Frame::new(MSG_RESPONSE, id, bytes),
        Err(e) => {
            tracing::error!("reply encoding failed: {}", e);
            Frame::new(MSG_ERROR, id, e.to_string().into_bytes())
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    max_frame_bytes: u32,
    inbound: mpsc::Sender<Frame>,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break,
            frame = read_frame(&mut reader, max_frame_bytes) => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                if inbound.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("rpc read failed: {}", e);
                break;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Frame>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            next = outbound.recv() => {
                let Some(frame) = next else { break };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::debug!("rpc write failed: {}", e);
                    break;
                }
            }
        }
    }
}
