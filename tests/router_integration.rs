//! Router integration tests: two kernels talking over loopback TCP through a
//! shared in-memory store.

use async_trait::async_trait;
use mesh_kernel::ipc::{Channel, Connector, TcpConnector};
use mesh_kernel::kernel::pool::ConnectionStats;
use mesh_kernel::store::MemoryStore;
use mesh_kernel::types::{ComponentSettings, TransportConfig};
use mesh_kernel::{CallContext, Component, Config, Error, Kernel, KernelHandle, Payload, Result};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Default)]
struct Echo {
    kernel: Option<KernelHandle>,
}

#[async_trait]
impl Component for Echo {
    async fn load(
        &mut self,
        _settings: &ComponentSettings,
        _name: &str,
        kernel: &KernelHandle,
    ) -> Result<()> {
        self.kernel = Some(kernel.clone());
        Ok(())
    }

    async fn dispatch(
        &self,
        method: &str,
        request: Payload,
        ctx: &mut CallContext,
    ) -> Result<Payload> {
        match method {
            "Echo" => {
                let text: String = request.decode()?;
                Ok(Payload::new(text))
            }
            "Whoami" => Ok(Payload::new(ctx.user_id.clone())),
            "Slow" => {
                tokio::time::sleep(Duration::from_millis(600)).await;
                Ok(Payload::new("slow done".to_string()))
            }
            "Panic" => panic!("handler blew up"),
            "Reject" => Err(Error::application("ROOM_FULL", "room is full")),
            "LockedDepth" => {
                let kernel = self
                    .kernel
                    .as_ref()
                    .ok_or_else(|| Error::server("echo not loaded"))?;
                let locks = kernel.locks();
                let handle = locks.acquire_for_context("room-42", ctx, "echo").await?;
                let depth = ctx.lock_stack.len() as u32;
                locks
                    .release_for_context("room-42", ctx, "echo", handle)
                    .await;
                Ok(Payload::new(depth))
            }
            _ => Err(Error::server(format!("echo has no method {}", method))),
        }
    }
}

/// Connector that counts dials before handing off to TCP.
#[derive(Debug)]
struct CountingConnector {
    inner: TcpConnector,
    dials: AtomicUsize,
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Channel>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(endpoint).await
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.listen_addr = "127.0.0.1:0".to_string();
    config.registry.ttl = Duration::from_millis(400);
    config.registry.publish_interval = Duration::from_millis(100);
    config.transport.call_timeout = Duration::from_millis(500);
    config.lock.max_retries = 3;
    config.lock.retry_delay = Duration::from_millis(20);
    config
}

fn open(names: &[&str]) -> ComponentSettings {
    let mut settings = ComponentSettings::new();
    for name in names {
        settings.insert(format!("{}.open", name), "true");
    }
    settings
}

async fn host_echo(store: &MemoryStore) -> Kernel {
    host_echo_with(store, test_config()).await
}

async fn host_echo_with(store: &MemoryStore, config: Config) -> Kernel {
    let kernel = Kernel::builder(config)
        .store(Arc::new(store.clone()))
        .settings(open(&["echo"]))
        .component("echo", Echo::default())
        .build()
        .await
        .unwrap();
    kernel.start().await.unwrap();
    kernel.publish_now().await.unwrap();
    kernel
}

async fn caller(store: &MemoryStore) -> Kernel {
    caller_with(store, test_config()).await
}

async fn caller_with(store: &MemoryStore, config: Config) -> Kernel {
    let kernel = Kernel::builder(config)
        .store(Arc::new(store.clone()))
        .build()
        .await
        .unwrap();
    kernel.start().await.unwrap();
    kernel
}

fn echo_connections(stats: Vec<ConnectionStats>) -> Vec<ConnectionStats> {
    stats.into_iter().filter(|s| s.component == "echo").collect()
}

#[tokio::test]
async fn test_remote_call_end_to_end_reuses_connection() {
    let store = MemoryStore::new();
    let a = host_echo(&store).await;
    let b = caller(&store).await;

    let mut ctx = CallContext::for_user("player-7", "conn-1");
    let mut reply = String::new();
    b.router()
        .call("echo", "Echo", "hello".to_string(), &mut ctx, &mut reply)
        .await
        .unwrap();
    assert_eq!(reply, "hello");

    let first = echo_connections(b.pool().stats().await);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].endpoint, a.endpoint());
    assert_eq!(first[0].state, "ready");

    let mut who = String::new();
    b.router()
        .call("echo", "Whoami", (), &mut ctx, &mut who)
        .await
        .unwrap();
    assert_eq!(who, "player-7");

    let second = echo_connections(b.pool().stats().await);
    assert_eq!(second, first);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_local_component_never_dials() {
    let store = MemoryStore::new();
    let remote = host_echo(&store).await;

    let connector = Arc::new(CountingConnector {
        inner: TcpConnector::new(TransportConfig::default()),
        dials: AtomicUsize::new(0),
    });
    let local = Kernel::builder(test_config())
        .store(Arc::new(store.clone()))
        .connector(connector.clone())
        .settings(open(&["echo"]))
        .component("echo", Echo::default())
        .build()
        .await
        .unwrap();
    local.start().await.unwrap();
    local.publish_now().await.unwrap();
    assert_eq!(local.discovery().find_all("echo").await.unwrap().len(), 2);

    let mut ctx = CallContext::default();
    for _ in 0..5 {
        let reply = local
            .router()
            .call_any_reply("echo", "Echo", Payload::new("x".to_string()), &mut ctx)
            .await
            .unwrap();
        assert!(reply.is_local());
    }
    assert_eq!(connector.dials.load(Ordering::SeqCst), 0);

    local.shutdown().await;
    remote.shutdown().await;
}

#[tokio::test]
async fn test_remote_and_local_errors_are_identical() {
    let store = MemoryStore::new();
    let a = host_echo(&store).await;
    let b = caller(&store).await;
    let mut ctx = CallContext::default();

    let remote = b
        .router()
        .call_any_reply("echo", "Reject", Payload::unit(), &mut ctx)
        .await
        .unwrap_err();
    let local = a
        .router()
        .call_any_reply("echo", "Reject", Payload::unit(), &mut ctx)
        .await
        .unwrap_err();
    assert_eq!(remote.to_reply(), local.to_reply());
    assert!(matches!(remote, Error::Application(ref m) if m.code == "ROOM_FULL"));

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_remote_panic_is_server_error_and_server_survives() {
    let store = MemoryStore::new();
    let a = host_echo(&store).await;
    let b = caller(&store).await;
    let mut ctx = CallContext::default();

    let err = b
        .router()
        .call_any_reply("echo", "Panic", Payload::unit(), &mut ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Server(ref m) if m.contains("handler blew up")));

    let mut reply = String::new();
    b.router()
        .call("echo", "Echo", "still here".to_string(), &mut ctx, &mut reply)
        .await
        .unwrap();
    assert_eq!(reply, "still here");

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_silent_peer_times_out_within_deadline() {
    let store = MemoryStore::new();
    let b = caller(&store).await;

    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap().to_string();
    let _hold = tokio::spawn(async move {
        let (_stream, _) = silent.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
    });
    b.discovery().publish("silent", &silent_addr).await.unwrap();

    let mut ctx = CallContext::default();
    let started = tokio::time::Instant::now();
    let err = b
        .router()
        .call_any_reply("silent", "Anything", Payload::unit(), &mut ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(2));

    b.shutdown().await;
}

#[tokio::test]
async fn test_lock_stack_travels_with_remote_call() {
    let store = MemoryStore::new();
    let a = host_echo(&store).await;
    let b = caller(&store).await;

    let mut ctx = CallContext::for_user("player-7", "conn-1");
    let handle = b
        .locks()
        .acquire_for_context("room-42", &mut ctx, "room")
        .await
        .unwrap();
    assert!(handle.is_some());

    // The remote side sees the caller's record and nests virtually instead of
    // waiting on the lock its own call chain already holds.
    let mut depth = 0u32;
    b.router()
        .call("echo", "LockedDepth", (), &mut ctx, &mut depth)
        .await
        .unwrap();
    assert_eq!(depth, 2);
    assert_eq!(ctx.lock_stack.len(), 1);

    b.locks()
        .release_for_context("room-42", &mut ctx, "room", handle)
        .await;
    assert!(ctx.lock_stack.is_empty());

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_call_by_endpoint_targets_one_process() {
    let store = MemoryStore::new();
    let a1 = host_echo(&store).await;
    let a2 = host_echo(&store).await;
    let b = caller(&store).await;
    let mut ctx = CallContext::default();

    for target in [a1.endpoint(), a2.endpoint()] {
        let mut reply = String::new();
        b.router()
            .call_by_endpoint(target, "echo", "Echo", "pinned".to_string(), &mut ctx, &mut reply)
            .await
            .unwrap();
        assert_eq!(reply, "pinned");
    }
    let endpoints: Vec<String> = echo_connections(b.pool().stats().await)
        .into_iter()
        .map(|s| s.endpoint)
        .collect();
    let mut expected = vec![a1.endpoint().to_string(), a2.endpoint().to_string()];
    expected.sort();
    assert_eq!(endpoints, expected);

    let err = b
        .router()
        .call_endpoint_any_reply("127.0.0.1:1", "echo", "Echo", Payload::unit(), &mut ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    b.shutdown().await;
    a2.shutdown().await;
    a1.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_instance() {
    let store = MemoryStore::new();
    let a1 = host_echo(&store).await;
    let a2 = host_echo(&store).await;
    let b = caller(&store).await;

    let results = b
        .router()
        .broadcast("echo", "Echo", &"all hands".to_string(), &CallContext::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    for (_, result) in results {
        assert_eq!(result.unwrap().decode::<String>().unwrap(), "all hands");
    }

    b.shutdown().await;
    a2.shutdown().await;
    a1.shutdown().await;
}

#[tokio::test]
async fn test_stopped_peer_lapses_and_is_evicted() {
    let store = MemoryStore::new();
    let a = host_echo(&store).await;
    let b = caller(&store).await;

    let mut ctx = CallContext::default();
    let mut reply = String::new();
    b.router()
        .call("echo", "Echo", "ping".to_string(), &mut ctx, &mut reply)
        .await
        .unwrap();
    assert_eq!(echo_connections(b.pool().stats().await).len(), 1);

    a.shutdown().await;
    // One TTL plus one publish period.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(b.discovery().find_all("echo").await.unwrap().is_empty());

    let summary = b.pool().refresh().await;
    assert_eq!(summary.evicted, 1);
    assert!(echo_connections(b.pool().stats().await).is_empty());

    let err = b
        .router()
        .call_any_reply("echo", "Echo", Payload::new("gone".to_string()), &mut ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)));

    b.shutdown().await;
}

#[tokio::test]
async fn test_retiring_connection_finishes_in_flight_and_is_replaced() {
    let store = MemoryStore::new();
    let mut server_config = test_config();
    server_config.transport.max_connection_age = Duration::from_millis(200);
    server_config.transport.max_connection_age_grace = Duration::from_secs(3);
    let a = host_echo_with(&store, server_config).await;
    let mut caller_config = test_config();
    caller_config.transport.call_timeout = Duration::from_secs(2);
    let b = Arc::new(caller_with(&store, caller_config).await);

    let slow = {
        let b = b.clone();
        tokio::spawn(async move {
            let mut ctx = CallContext::for_user("player-7", "conn-1");
            let mut reply = String::new();
            b.router()
                .call("echo", "Slow", (), &mut ctx, &mut reply)
                .await
                .map(|()| reply)
        })
    };

    // The server has sent GOAWAY on the first connection by now.
    tokio::time::sleep(Duration::from_millis(350)).await;
    let retiring = echo_connections(b.pool().stats().await);
    assert_eq!(retiring.len(), 1);
    assert_eq!(retiring[0].state, "idle");

    let mut ctx = CallContext::for_user("player-8", "conn-2");
    let mut reply = String::new();
    b.router()
        .call("echo", "Echo", "fresh".to_string(), &mut ctx, &mut reply)
        .await
        .unwrap();
    assert_eq!(reply, "fresh");
    assert_eq!(ctx.user_id, "player-8");

    assert_eq!(slow.await.unwrap().unwrap(), "slow done");
    let replaced = echo_connections(b.pool().stats().await);
    assert_eq!(replaced.len(), 1);
    assert_ne!(replaced[0].connection_id, retiring[0].connection_id);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_refresher_evicts_lapsed_peer_on_its_own() {
    let store = MemoryStore::new();
    let a = host_echo(&store).await;
    let mut config = test_config();
    config.pool.refresh_interval = Duration::from_millis(100);
    let b = caller_with(&store, config).await;

    let mut ctx = CallContext::default();
    let mut reply = String::new();
    b.router()
        .call("echo", "Echo", "ping".to_string(), &mut ctx, &mut reply)
        .await
        .unwrap();
    assert_eq!(echo_connections(b.pool().stats().await).len(), 1);

    a.shutdown().await;
    // One TTL, one publish period and one refresh period.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(echo_connections(b.pool().stats().await).is_empty());

    b.shutdown().await;
}
