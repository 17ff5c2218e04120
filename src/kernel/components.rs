//! Component table: the in-process registry of loaded components.
//!
//! Components are addressed by two strings, (component, method). Each
//! component implements [`Component::dispatch`], matching the method name to a
//! typed handler, which replaces runtime method lookup with an explicit table
//! built at startup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::KernelHandle;
use crate::types::{CallContext, ComponentSettings, Error, Payload, Result};

/// Settings key suffix marking a component reachable from other processes.
pub const SETTING_OPEN: &str = "open";
/// Settings key suffix selecting a shard index.
pub const SETTING_SHARD: &str = "shard";

/// A named service unit hosted by this process.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Called once at startup with the flattened settings map, before the
    /// component becomes callable. `kernel` is the handle through which the
    /// component reaches the router and the lock service.
    async fn load(
        &mut self,
        _settings: &ComponentSettings,
        _name: &str,
        _kernel: &KernelHandle,
    ) -> Result<()> {
        Ok(())
    }

    /// Invoke `method` with a request payload and the caller's context.
    ///
    /// Unknown methods should return [`unknown_method`].
    async fn dispatch(
        &self,
        method: &str,
        request: Payload,
        ctx: &mut CallContext,
    ) -> Result<Payload>;
}

/// Error for a method name the component does not serve.
pub fn unknown_method(component: &str, method: &str) -> Error {
    Error::server(format!("component {} has no method {}", component, method))
}

/// Identity of a loaded component instance. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub name: String,
    pub endpoint: String,
    pub is_open: bool,
}

impl ComponentRecord {
    /// Name of one shard of a multi-instance component.
    pub fn shard_name(name: &str, index: u32) -> String {
        format!("{}_{}", name, index)
    }
}

struct LoadedComponent {
    record: ComponentRecord,
    handler: Arc<dyn Component>,
}

/// Name → component map. Filled at startup, read on every call.
#[derive(Default)]
pub struct ComponentTable {
    entries: RwLock<BTreeMap<String, LoadedComponent>>,
}

impl fmt::Debug for ComponentTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = match self.entries.try_read() {
            Ok(entries) => entries.keys().cloned().collect(),
            Err(_) => vec!["<locked>".to_string()],
        };
        f.debug_struct("ComponentTable").field("components", &names).finish()
    }
}

impl ComponentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a component under `name`.
    ///
    /// Reads `<name>.open` and `<name>.shard` from `settings`; a shard index
    /// registers the component as `<name>_<shard>`. Fails if the resulting
    /// name is already taken.
    pub async fn load(
        &self,
        mut component: Box<dyn Component>,
        name: &str,
        settings: &ComponentSettings,
        endpoint: &str,
        kernel: &KernelHandle,
    ) -> Result<ComponentRecord> {
        let is_open = settings.get_bool(&format!("{}.{}", name, SETTING_OPEN));
        let registered_name = match settings.get_u32(&format!("{}.{}", name, SETTING_SHARD))? {
            Some(shard) => ComponentRecord::shard_name(name, shard),
            None => name.to_string(),
        };

        if self.contains(&registered_name).await {
            return Err(Error::server(format!(
                "component {} is already loaded",
                registered_name
            )));
        }

        component.load(settings, &registered_name, kernel).await?;

        let record = ComponentRecord {
            name: registered_name.clone(),
            endpoint: endpoint.to_string(),
            is_open,
        };
        self.entries.write().await.insert(
            registered_name,
            LoadedComponent {
                record: record.clone(),
                handler: Arc::from(component),
            },
        );
        tracing::info!(
            component = %record.name,
            endpoint = %record.endpoint,
            open = record.is_open,
            "component loaded"
        );
        Ok(record)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.entries
            .read()
            .await
            .get(name)
            .map(|c| c.handler.clone())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    pub async fn records(&self) -> Vec<ComponentRecord> {
        self.entries
            .read()
            .await
            .values()
            .map(|c| c.record.clone())
            .collect()
    }

    /// Records that must appear in discovery.
    pub async fn open_records(&self) -> Vec<ComponentRecord> {
        self.entries
            .read()
            .await
            .values()
            .filter(|c| c.record.is_open)
            .map(|c| c.record.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::handle_for_tests;

    struct Counter;

    #[async_trait]
    impl Component for Counter {
        async fn dispatch(
            &self,
            method: &str,
            request: Payload,
            _ctx: &mut CallContext,
        ) -> Result<Payload> {
            match method {
                "Incr" => {
                    let n: u64 = request.decode()?;
                    Ok(Payload::new(n + 1))
                }
                _ => Err(unknown_method("counter", method)),
            }
        }
    }

    #[tokio::test]
    async fn test_load_reads_open_and_shard() {
        let table = ComponentTable::new();
        let handle = handle_for_tests();
        let settings = ComponentSettings::flatten(&serde_json::json!({
            "room": {"open": true, "shard": 2},
            "counter": {"open": false},
        }));

        let room = table
            .load(Box::new(Counter), "room", &settings, "127.0.0.1:7400", &handle)
            .await
            .unwrap();
        assert_eq!(room.name, "room_2");
        assert!(room.is_open);

        let counter = table
            .load(Box::new(Counter), "counter", &settings, "127.0.0.1:7400", &handle)
            .await
            .unwrap();
        assert!(!counter.is_open);

        assert_eq!(table.len().await, 2);
        let open = table.open_records().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].name, "room_2");
    }

    #[tokio::test]
    async fn test_duplicate_load_rejected() {
        let table = ComponentTable::new();
        let handle = handle_for_tests();
        let settings = ComponentSettings::new();
        table
            .load(Box::new(Counter), "counter", &settings, "e:1", &handle)
            .await
            .unwrap();
        let err = table
            .load(Box::new(Counter), "counter", &settings, "e:1", &handle)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already loaded"));
    }

    #[tokio::test]
    async fn test_dispatch_through_table() {
        let table = ComponentTable::new();
        let handle = handle_for_tests();
        table
            .load(Box::new(Counter), "counter", &ComponentSettings::new(), "e:1", &handle)
            .await
            .unwrap();

        let component = table.get("counter").await.unwrap();
        let mut ctx = CallContext::default();
        let reply = component
            .dispatch("Incr", Payload::new(41u64), &mut ctx)
            .await
            .unwrap();
        assert_eq!(reply.decode::<u64>().unwrap(), 42);

        let err = component
            .dispatch("Decr", Payload::new(1u64), &mut ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no method Decr"));
        assert!(table.get("missing").await.is_none());
    }
}
