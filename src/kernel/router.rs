//! Router: the single entry point components use to call one another.
//!
//! A call names its target by (component, method). When the component is
//! loaded in this process the handler runs in place and the payload is never
//! serialized; otherwise the envelope goes over a pooled RPC connection.
//! Both paths recover panics and normalize errors identically, so a caller
//! cannot tell where the component lives.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use super::components::ComponentTable;
use super::pool::{ConnectionPool, PooledConnection};
use super::recovery::with_recovery_async;
use crate::ipc::Envelope;
use crate::types::{CallContext, Error, Payload, Result};

/// Per-endpoint outcome of a broadcast.
pub type BroadcastResult = Vec<(String, Result<Payload>)>;

#[derive(Debug)]
pub struct Router {
    table: Arc<ComponentTable>,
    pool: Arc<ConnectionPool>,
    local_endpoint: String,
}

impl Router {
    pub fn new(
        table: Arc<ComponentTable>,
        pool: Arc<ConnectionPool>,
        local_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            table,
            pool,
            local_endpoint: local_endpoint.into(),
        }
    }

    pub fn local_endpoint(&self) -> &str {
        &self.local_endpoint
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Call `component.method`, decoding the reply into `reply`.
    ///
    /// `reply` is left untouched on error.
    pub async fn call<Req, Rep>(
        &self,
        component: &str,
        method: &str,
        request: Req,
        ctx: &mut CallContext,
        reply: &mut Rep,
    ) -> Result<()>
    where
        Req: Serialize + Send + 'static,
        Rep: DeserializeOwned + 'static,
    {
        let payload = self
            .call_any_reply(component, method, Payload::new(request), ctx)
            .await?;
        *reply = payload.decode()?;
        Ok(())
    }

    /// Call `component.method` and return the reply payload as produced.
    pub async fn call_any_reply(
        &self,
        component: &str,
        method: &str,
        request: Payload,
        ctx: &mut CallContext,
    ) -> Result<Payload> {
        if self.table.contains(component).await {
            return self.call_local(component, method, request, ctx).await;
        }
        let conn = self.pool.get_or_create(component).await?;
        self.call_remote(&conn, method, request, ctx).await
    }

    /// Call `component.method` on the process at `endpoint`, bypassing the
    /// random endpoint pick.
    pub async fn call_by_endpoint<Req, Rep>(
        &self,
        endpoint: &str,
        component: &str,
        method: &str,
        request: Req,
        ctx: &mut CallContext,
        reply: &mut Rep,
    ) -> Result<()>
    where
        Req: Serialize + Send + 'static,
        Rep: DeserializeOwned + 'static,
    {
        let payload = self
            .call_endpoint_any_reply(endpoint, component, method, Payload::new(request), ctx)
            .await?;
        *reply = payload.decode()?;
        Ok(())
    }

    pub async fn call_endpoint_any_reply(
        &self,
        endpoint: &str,
        component: &str,
        method: &str,
        request: Payload,
        ctx: &mut CallContext,
    ) -> Result<Payload> {
        if endpoint == self.local_endpoint && self.table.contains(component).await {
            return self.call_local(component, method, request, ctx).await;
        }
        let conn = self.pool.get_or_create_by_endpoint(component, endpoint).await?;
        self.call_remote(&conn, method, request, ctx).await
    }

    /// Call `component.method` on every live instance.
    ///
    /// Each call gets its own copy of `ctx`; lock records taken by one
    /// instance never leak into the others or back to the caller.
    pub async fn broadcast<Req>(
        &self,
        component: &str,
        method: &str,
        request: &Req,
        ctx: &CallContext,
    ) -> Result<BroadcastResult>
    where
        Req: Serialize + Clone + Send + 'static,
    {
        let endpoints = self.pool.discovery().find_all(component).await?;
        let calls = endpoints.into_iter().map(|endpoint| {
            let mut branch_ctx = ctx.clone();
            let request = Payload::new(request.clone());
            async move {
                let result = self
                    .call_endpoint_any_reply(&endpoint, component, method, request, &mut branch_ctx)
                    .await;
                (endpoint, result)
            }
        });
        Ok(futures::future::join_all(calls).await)
    }

    async fn call_local(
        &self,
        component: &str,
        method: &str,
        request: Payload,
        ctx: &mut CallContext,
    ) -> Result<Payload> {
        let handler = self
            .table
            .get(component)
            .await
            .ok_or_else(|| Error::server(format!("component {} is not hosted here", component)))?;
        let operation = format!("{}.{}", component, method);
        with_recovery_async(handler.dispatch(method, request, ctx), &operation)
            .await
            .map_err(Error::normalize_handler_error)
    }

    async fn call_remote(
        &self,
        conn: &PooledConnection,
        method: &str,
        request: Payload,
        ctx: &mut CallContext,
    ) -> Result<Payload> {
        let wire = request.into_wire()?;
        let envelope = Envelope::request(conn.component.clone(), method, wire, ctx.clone());
        let operation = format!("{}.{}", conn.component, method);

        let sent = with_recovery_async(conn.channel.send(envelope), &operation).await;
        let reply = match sent {
            Ok(reply) => reply,
            Err(e) => {
                if matches!(e, Error::Unavailable(_)) {
                    self.pool
                        .evict(&conn.component, &conn.endpoint, conn.id())
                        .await;
                }
                tracing::debug!(
                    operation = %operation,
                    endpoint = %conn.endpoint,
                    "remote call failed: {}",
                    e
                );
                return Err(e);
            }
        };

        // Adopt the returned context only from a reply to this request.
        if reply.component != conn.component || reply.method != method {
            tracing::warn!(
                operation = %operation,
                endpoint = %conn.endpoint,
                "reply does not answer this request, keeping caller context"
            );
            return reply.into_result().map(|(payload, _)| payload);
        }

        let returned_ctx = reply.context.clone();
        let result = reply.into_result();
        let caller_records_kept = returned_ctx.lock_stack.len() == ctx.lock_stack.len()
            && returned_ctx
                .lock_stack
                .iter()
                .zip(ctx.lock_stack.iter())
                .all(|(returned, sent)| returned == sent);
        if !caller_records_kept {
            tracing::warn!(
                operation = %operation,
                sent = %ctx.lock_stack,
                returned = %returned_ctx.lock_stack,
                "remote handler returned with unbalanced lock stack"
            );
        }
        *ctx = returned_ctx;
        result.map(|(payload, _)| payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::components::{unknown_method, Component};
    use crate::kernel::discovery::Discovery;
    use crate::kernel::testing::handle_for_tests;
    use crate::ipc::{Channel, ConnectivityState, Connector};
    use crate::store::MemoryStore;
    use crate::types::{ComponentSettings, LockRecord};
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct JoinRoom {
        room_id: u32,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Joined {
        seat: u8,
    }

    struct Room;

    #[async_trait]
    impl Component for Room {
        async fn dispatch(
            &self,
            method: &str,
            request: Payload,
            ctx: &mut CallContext,
        ) -> Result<Payload> {
            match method {
                "Join" => {
                    let req: JoinRoom = request.decode()?;
                    ctx.roles.push(format!("room:{}", req.room_id));
                    Ok(Payload::new(Joined { seat: 3 }))
                }
                "Full" => Err(Error::application("ROOM_FULL", "room is full")),
                "Crash" => panic!("seat table corrupted"),
                "Missing" => Err(Error::not_found("no such seat")),
                _ => Err(unknown_method("room", method)),
            }
        }
    }

    #[derive(Debug, Default)]
    struct CountingConnector {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Channel>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Err(Error::unavailable(format!("no network in unit tests ({})", endpoint)))
        }
    }

    async fn router_with_room() -> (Router, Arc<CountingConnector>, MemoryStore) {
        let store = MemoryStore::new();
        let connector = Arc::new(CountingConnector::default());
        let discovery = Discovery::new(Arc::new(store.clone()), Duration::from_secs(1));
        let pool = Arc::new(ConnectionPool::new(discovery, connector.clone()));
        let table = Arc::new(ComponentTable::new());
        let settings = ComponentSettings::flatten(&serde_json::json!({"room": {"open": true}}));
        table
            .load(Box::new(Room), "room", &settings, "10.0.0.1:7400", &handle_for_tests())
            .await
            .unwrap();
        // Also advertised in discovery; the local path must still win.
        pool.discovery().publish("room", "10.0.0.1:7400").await.unwrap();
        (Router::new(table, pool, "10.0.0.1:7400"), connector, store)
    }

    #[tokio::test]
    async fn test_local_call_skips_transport() {
        let (router, connector, _store) = router_with_room().await;
        let mut ctx = CallContext::for_user("u1", "c1");
        let mut reply = Joined::default();
        router
            .call("room", "Join", JoinRoom { room_id: 42 }, &mut ctx, &mut reply)
            .await
            .unwrap();
        assert_eq!(reply, Joined { seat: 3 });
        assert_eq!(ctx.roles, vec!["room:42".to_string()]);
        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_local_reply_is_not_serialized() {
        let (router, _, _store) = router_with_room().await;
        let mut ctx = CallContext::default();
        let reply = router
            .call_any_reply("room", "Join", Payload::new(JoinRoom { room_id: 1 }), &mut ctx)
            .await
            .unwrap();
        assert!(reply.is_local());
    }

    #[tokio::test]
    async fn test_local_errors_match_wire_contract() {
        let (router, _, _store) = router_with_room().await;
        let mut ctx = CallContext::default();
        let mut reply = Joined::default();

        let err = router
            .call("room", "Full", JoinRoom { room_id: 1 }, &mut ctx, &mut reply)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Application(ref m) if m.code == "ROOM_FULL"));

        // Non-application kinds come back the way they would after a network hop.
        let err = router
            .call("room", "Missing", JoinRoom { room_id: 1 }, &mut ctx, &mut reply)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Application(ref m) if m.code == "NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_local_panic_is_server_error() {
        let (router, _, _store) = router_with_room().await;
        let mut ctx = CallContext::default();
        let err = router
            .call_any_reply("room", "Crash", Payload::unit(), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Server(ref m) if m.contains("seat table corrupted")));
    }

    #[tokio::test]
    async fn test_local_endpoint_short_circuits_by_endpoint() {
        let (router, connector, _store) = router_with_room().await;
        let mut ctx = CallContext::default();
        let mut reply = Joined::default();
        router
            .call_by_endpoint(
                "10.0.0.1:7400",
                "room",
                "Join",
                JoinRoom { room_id: 7 },
                &mut ctx,
                &mut reply,
            )
            .await
            .unwrap();
        assert_eq!(reply.seat, 3);
        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_remote_component_is_unavailable() {
        let (router, connector, _store) = router_with_room().await;
        let mut ctx = CallContext::default();
        let err = router
            .call_any_reply("chat", "Send", Payload::unit(), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_dial_failure_is_unavailable() {
        let (router, connector, _store) = router_with_room().await;
        router
            .pool()
            .discovery()
            .publish("chat", "10.0.0.2:7400")
            .await
            .unwrap();
        let mut ctx = CallContext::default();
        let err = router
            .call_any_reply("chat", "Send", Payload::unit(), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_includes_local_instance() {
        let (router, _, _store) = router_with_room().await;
        let ctx = CallContext::default();
        let results = router
            .broadcast("room", "Join", &JoinRoom { room_id: 9 }, &ctx)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        let (endpoint, result) = results.into_iter().next().unwrap();
        assert_eq!(endpoint, "10.0.0.1:7400");
        let joined: Joined = result.unwrap().decode().unwrap();
        assert_eq!(joined.seat, 3);
        assert!(ctx.roles.is_empty());
    }

    type Script = fn(Envelope) -> Result<Envelope>;

    /// Always-ready channel answering every call from a fixed script.
    #[derive(Debug)]
    struct ScriptedChannel {
        endpoint: String,
        script: Script,
    }

    #[async_trait]
    impl Channel for ScriptedChannel {
        fn id(&self) -> u64 {
            77
        }

        fn endpoint(&self) -> &str {
            &self.endpoint
        }

        fn state(&self) -> ConnectivityState {
            ConnectivityState::Ready
        }

        async fn send(&self, envelope: Envelope) -> Result<Envelope> {
            (self.script)(envelope)
        }

        fn close(&self) {}
    }

    #[derive(Debug)]
    struct ScriptedConnector {
        script: Script,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Channel>> {
            Ok(Arc::new(ScriptedChannel {
                endpoint: endpoint.to_string(),
                script: self.script,
            }))
        }
    }

    async fn router_with_remote_chat(script: Script) -> Router {
        let store = MemoryStore::new();
        let discovery = Discovery::new(Arc::new(store), Duration::from_secs(60));
        let pool = Arc::new(ConnectionPool::new(
            discovery,
            Arc::new(ScriptedConnector { script }),
        ));
        pool.discovery().publish("chat", "10.0.0.2:7400").await.unwrap();
        Router::new(Arc::new(ComponentTable::new()), pool, "10.0.0.1:7400")
    }

    fn holding_room() -> CallContext {
        let mut ctx = CallContext::for_user("player-7", "conn-1");
        ctx.lock_stack
            .push(LockRecord::new("room", "room-42", true));
        ctx
    }

    #[tokio::test]
    async fn test_remote_reply_context_is_adopted() {
        let router = router_with_remote_chat(|request| {
            let mut ctx = request.context.clone();
            ctx.roles.push("seen".to_string());
            Ok(request.reply(Payload::unit().into_wire()?, ctx))
        })
        .await;
        let mut ctx = holding_room();
        router
            .call_any_reply("chat", "Send", Payload::unit(), &mut ctx)
            .await
            .unwrap();
        assert_eq!(ctx.roles, vec!["seen".to_string()]);
        assert_eq!(ctx.lock_stack, holding_room().lock_stack);
    }

    #[tokio::test]
    async fn test_reply_to_other_request_keeps_caller_context() {
        let router = router_with_remote_chat(|_| {
            Ok(Envelope::undecodable(&Error::server("cannot decode envelope")))
        })
        .await;
        let mut ctx = holding_room();
        let err = router
            .call_any_reply("chat", "Send", Payload::unit(), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Server(_)));
        assert_eq!(ctx.user_id, "player-7");
        assert_eq!(ctx.lock_stack, holding_room().lock_stack);
    }

    #[tokio::test]
    async fn test_refused_call_keeps_context_and_evicts() {
        let router = router_with_remote_chat(|_| {
            Err(Error::unavailable("10.0.0.2:7400 refused the request: draining"))
        })
        .await;
        let mut ctx = holding_room();
        let err = router
            .call_any_reply("chat", "Send", Payload::unit(), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert_eq!(ctx.lock_stack, holding_room().lock_stack);
        assert!(router.pool().stats().await.is_empty());
    }
}
