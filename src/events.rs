use crate::config::{ServerConfig, TargetConfig};
use crate::engine::ServiceReport;
use crate::proxy::Link;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDeleted {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetChange {
    pub server_id: String,
    pub target: TargetConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDeleted {
    pub server_id: String,
    pub target_id: String,
}

/// Everything the engine and the management API tell the outside world.
///
/// Each variant maps to a fixed numeric kind on the wire; subscribers get
/// `{"id": <kind>, "data": <record>}`.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    ServiceStatus(ServiceReport),
    ConnectionOpened(Link),
    ConnectionClosed(Link),
    ServerAdded(ServerConfig),
    ServerDeleted(ServerDeleted),
    ServerModified(ServerConfig),
    TargetAdded(TargetChange),
    TargetDeleted(TargetDeleted),
    TargetModified(TargetChange),
}

impl ProxyEvent {
    pub fn kind(&self) -> u16 {
        match self {
            ProxyEvent::ServiceStatus(_) => 1001,
            ProxyEvent::ConnectionOpened(_) => 1002,
            ProxyEvent::ConnectionClosed(_) => 1003,
            ProxyEvent::ServerAdded(_) => 1011,
            ProxyEvent::ServerDeleted(_) => 1012,
            ProxyEvent::ServerModified(_) => 1013,
            ProxyEvent::TargetAdded(_) => 1021,
            ProxyEvent::TargetDeleted(_) => 1022,
            ProxyEvent::TargetModified(_) => 1023,
        }
    }

    /// Wire form for WebSocket subscribers.
    pub fn to_message(&self) -> serde_json::Value {
        let data = match self {
            ProxyEvent::ServiceStatus(v) => serde_json::to_value(v),
            ProxyEvent::ConnectionOpened(v) | ProxyEvent::ConnectionClosed(v) => {
                serde_json::to_value(v)
            }
            ProxyEvent::ServerAdded(v) | ProxyEvent::ServerModified(v) => serde_json::to_value(v),
            ProxyEvent::ServerDeleted(v) => serde_json::to_value(v),
            ProxyEvent::TargetAdded(v) | ProxyEvent::TargetModified(v) => serde_json::to_value(v),
            ProxyEvent::TargetDeleted(v) => serde_json::to_value(v),
        }
        .unwrap_or(serde_json::Value::Null);

        json!({ "id": self.kind(), "data": data })
    }
}

/// Best-effort fan-out bus. Slow subscribers lose messages instead of
/// applying backpressure to the data plane.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Publishing with no subscribers is fine.
    pub fn publish(&self, event: ProxyEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
