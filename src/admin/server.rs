use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::AdminApi;

/// HTTP server fronting the management API.
pub struct AdminServer {
    api: Arc<AdminApi>,
    address: SocketAddr,
}

impl AdminServer {
    pub fn new(api: AdminApi, address: SocketAddr) -> Self {
        Self {
            api: Arc::new(api),
            address,
        }
    }

    /// Start the management server
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.address).await?;
        info!("Management API listening on http://{}", self.address);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let api = Arc::clone(&self.api);

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let api = Arc::clone(&api);
                    async move {
                        debug!("Management request: {} {}", req.method(), req.uri().path());
                        Ok::<_, hyper::Error>(api.handle(req).await)
                    }
                });

                // with_upgrades keeps the connection alive for /proxy/ws.
                if let Err(e) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    error!("Management connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }
}
