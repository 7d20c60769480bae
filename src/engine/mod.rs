mod listener;

pub use listener::{Listener, ListenerStatus};

use crate::config::ConfigStore;
use crate::error::ProxyError;
use crate::events::{EventBus, ProxyEvent};
use crate::proxy::LinkRegistry;
use crate::route::RouteTable;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::info;

/// State every connection task can reach: the live-link registry and the
/// event bus.
pub struct EngineShared {
    pub registry: LinkRegistry,
    pub events: EventBus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerReport {
    pub address: String,
    pub tls: bool,
    pub status: ListenerStatus,
    pub domains: usize,
}

/// Observed engine state, served by the management API and published as a
/// status event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReport {
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    pub listeners: Vec<ListenerReport>,
    pub link_count: usize,
}

struct EngineInner {
    status: ServiceStatus,
    start_time: Option<u64>,
    listeners: HashMap<SocketAddr, Listener>,
}

/// Owns the listener set and realigns it with the configuration on demand.
///
/// All control-plane operations are serialized by one mutex; the data plane
/// never takes it.
pub struct Engine {
    store: Arc<ConfigStore>,
    shared: Arc<EngineShared>,
    inner: Mutex<EngineInner>,
}

impl Engine {
    pub fn new(store: Arc<ConfigStore>, events: EventBus) -> Self {
        Self {
            store,
            shared: Arc::new(EngineShared {
                registry: LinkRegistry::new(),
                events,
            }),
            inner: Mutex::new(EngineInner {
                status: ServiceStatus::Stopped,
                start_time: None,
                listeners: HashMap::new(),
            }),
        }
    }

    pub fn registry(&self) -> &LinkRegistry {
        &self.shared.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Builds the route table from the current configuration and brings the
    /// listener set up. Starting with zero listeners succeeds.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let mut inner = self.inner.lock().await;
        if inner.status == ServiceStatus::Running {
            return Ok(());
        }

        let table = self.desired_table()?;
        self.apply(&mut inner, table).await;
        inner.status = ServiceStatus::Running;
        inner.start_time = Some(now_millis());
        info!(
            "Proxy engine started with {} listener(s)",
            inner.listeners.len()
        );
        drop(inner);

        self.publish_status().await;
        Ok(())
    }

    /// Stops accepting everywhere. Waits (briefly) for accept loops only;
    /// in-flight pumps keep running to natural completion.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.status == ServiceStatus::Stopped {
            return;
        }

        for (_, listener) in inner.listeners.drain() {
            listener.stop().await;
        }
        inner.status = ServiceStatus::Stopped;
        inner.start_time = None;
        info!("Proxy engine stopped");
        drop(inner);

        self.publish_status().await;
    }

    pub async fn restart(&self) -> Result<(), ProxyError> {
        self.stop().await;
        self.start().await
    }

    /// Realigns the running listener set with the configuration. A no-op
    /// while stopped. On `ConfigConflict` the previous snapshot stays live.
    pub async fn reconcile(&self) -> Result<(), ProxyError> {
        let mut inner = self.inner.lock().await;
        if inner.status != ServiceStatus::Running {
            return Ok(());
        }

        let table = self.desired_table()?;
        self.apply(&mut inner, table).await;
        Ok(())
    }

    pub async fn status(&self) -> ServiceReport {
        let inner = self.inner.lock().await;
        let mut listeners: Vec<ListenerReport> = inner
            .listeners
            .values()
            .map(|l| ListenerReport {
                address: l.addr().to_string(),
                tls: l.tls(),
                status: l.status(),
                domains: l.domain_count(),
            })
            .collect();
        listeners.sort_by(|a, b| a.address.cmp(&b.address));

        ServiceReport {
            status: inner.status,
            start_time: inner.start_time,
            listeners,
            link_count: self.shared.registry.len(),
        }
    }

    fn desired_table(&self) -> Result<RouteTable, ProxyError> {
        let config = self.store.get();
        if config.reverse_proxy.disable {
            return Ok(RouteTable::default());
        }
        RouteTable::from_config(&config)
    }

    /// Diff-apply: stop listeners that fell out of the table, start newly
    /// appearing ones, swap route maps on survivors. A surviving key whose
    /// TLS mode changed, or whose earlier bind failed, is restarted.
    async fn apply(&self, inner: &mut EngineInner, table: RouteTable) {
        let stale: Vec<SocketAddr> = inner
            .listeners
            .keys()
            .filter(|addr| !table.listeners().contains_key(*addr))
            .copied()
            .collect();
        for addr in stale {
            if let Some(listener) = inner.listeners.remove(&addr) {
                listener.stop().await;
            }
        }

        for (addr, spec) in table.listeners() {
            let replace = match inner.listeners.get(addr) {
                Some(listener) => {
                    listener.tls() != spec.tls || listener.status() == ListenerStatus::Error
                }
                None => true,
            };

            if replace {
                if let Some(old) = inner.listeners.remove(addr) {
                    old.stop().await;
                }
                let listener = Listener::start(spec.clone(), Arc::clone(&self.shared)).await;
                inner.listeners.insert(*addr, listener);
            } else if let Some(listener) = inner.listeners.get(addr) {
                listener.swap_routes(spec.routes.clone());
            }
        }
    }

    async fn publish_status(&self) {
        let report = self.status().await;
        self.shared.events.publish(ProxyEvent::ServiceStatus(report));
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
