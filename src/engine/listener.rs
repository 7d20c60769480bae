use crate::engine::EngineShared;
use crate::error::ProxyError;
use crate::events::ProxyEvent;
use crate::metrics::Metrics;
use crate::proxy::{dialer, pump};
use crate::route::{ListenerSpec, Target};
use crate::sniff;
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// One bound acceptor. The accept task owns the socket; stopping aborts the
/// task, which closes the socket. Connection tasks are independent and run
/// to natural completion.
pub struct Listener {
    addr: SocketAddr,
    tls: bool,
    routes: Arc<ArcSwap<HashMap<String, Target>>>,
    status: Arc<RwLock<ListenerStatus>>,
    accept_task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Binds and starts accepting. A failed bind leaves this listener in
    /// `error` state without affecting any other listener.
    pub async fn start(spec: ListenerSpec, shared: Arc<EngineShared>) -> Self {
        let routes = Arc::new(ArcSwap::from_pointee(spec.routes));
        let status = Arc::new(RwLock::new(ListenerStatus::Starting));

        let socket = match TcpListener::bind(spec.addr).await {
            Ok(socket) => socket,
            Err(e) => {
                error!(
                    "{}",
                    ProxyError::Bind {
                        addr: spec.addr,
                        source: e
                    }
                );
                *status.write() = ListenerStatus::Error;
                return Self {
                    addr: spec.addr,
                    tls: spec.tls,
                    routes,
                    status,
                    accept_task: None,
                };
            }
        };

        info!(
            "Listener {} accepting ({})",
            spec.addr,
            if spec.tls { "tls passthrough" } else { "plain" }
        );
        *status.write() = ListenerStatus::Running;

        let accept_task = tokio::spawn(accept_loop(
            socket,
            spec.addr,
            spec.tls,
            Arc::clone(&routes),
            shared,
        ));

        Self {
            addr: spec.addr,
            tls: spec.tls,
            routes,
            status,
            accept_task: Some(accept_task),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    pub fn status(&self) -> ListenerStatus {
        *self.status.read()
    }

    pub fn domain_count(&self) -> usize {
        self.routes.load().len()
    }

    /// Atomically replaces the domain map. Connections accepted after the
    /// swap see the new routes; in-flight ones keep the target they already
    /// picked.
    pub fn swap_routes(&self, routes: HashMap<String, Target>) {
        self.routes.store(Arc::new(routes));
    }

    /// Stops accepting by aborting the accept task, which drops the socket.
    pub async fn stop(mut self) {
        *self.status.write() = ListenerStatus::Stopping;
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        *self.status.write() = ListenerStatus::Stopped;
        info!("Listener {} stopped", self.addr);
    }
}

async fn accept_loop(
    socket: TcpListener,
    addr: SocketAddr,
    tls: bool,
    routes: Arc<ArcSwap<HashMap<String, Target>>>,
    shared: Arc<EngineShared>,
) {
    let listen_label = addr.to_string();

    loop {
        let (stream, peer) = match socket.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Listener {} accept error: {}", addr, e);
                continue;
            }
        };

        // Pin the route snapshot for this connection's routing decision.
        let routes = routes.load_full();
        let shared = Arc::clone(&shared);
        let listen_label = listen_label.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, peer, addr, listen_label, tls, routes, shared).await
            {
                match e {
                    ProxyError::PumpIo { .. } => debug!(client = %peer, "{}", e),
                    _ => warn!(client = %peer, "Dropping connection: {}", e),
                }
            }
        });
    }
}

/// The whole per-connection pipeline: sniff, route, dial, register, pump.
async fn handle_client(
    client: TcpStream,
    peer: SocketAddr,
    listen_addr: SocketAddr,
    listen_label: String,
    tls: bool,
    routes: Arc<HashMap<String, Target>>,
    shared: Arc<EngineShared>,
) -> Result<(), ProxyError> {
    let domain = match sniff::sniff_domain(&client, tls).await {
        Ok(domain) => domain,
        Err(e) => {
            Metrics::record_sniff_failure(e.label());
            return Err(e);
        }
    };

    let Some(target) = routes.get(&domain) else {
        Metrics::record_route_miss(&listen_label);
        return Err(ProxyError::RouteNotFound(domain));
    };

    // The address the client actually dialed; under a wildcard bind this is
    // the concrete local address, which is what the preamble must carry.
    let local = client.local_addr().unwrap_or(listen_addr);

    let outcome = match dialer::dial(target, &domain, peer, local).await {
        Ok(outcome) => outcome,
        Err(e) => {
            Metrics::record_dial_failure(&domain);
            return Err(e);
        }
    };

    let link = shared.registry.open(
        listen_label,
        domain.clone(),
        peer.to_string(),
        outcome.target_addr.to_string(),
    );
    shared
        .events
        .publish(ProxyEvent::ConnectionOpened(link.clone()));
    Metrics::record_opened(&link.listen_addr, &link.domain);
    debug!(conn = %link.id, %domain, upstream = %outcome.target_addr, "Proxying connection");

    let result = pump::run(client, outcome.stream).await;

    Metrics::record_closed(&link.listen_addr, &link.domain);
    if let Some(closed) = shared.registry.close(&link.id) {
        shared.events.publish(ProxyEvent::ConnectionClosed(closed));
    }

    match result {
        Ok((sent, received)) => {
            Metrics::record_bytes(sent, received);
            debug!(conn = %link.id, sent, received, "Connection closed");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
