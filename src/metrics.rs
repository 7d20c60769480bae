use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize metrics with descriptions
pub fn init_metrics() {
    describe_counter!(
        "proxy_connections_opened_total",
        "Connections that routed and reached an upstream"
    );
    describe_counter!(
        "proxy_connections_closed_total",
        "Connections whose byte pump has finished"
    );
    describe_counter!(
        "proxy_sniff_failures_total",
        "Connections dropped before routing, by failure kind"
    );
    describe_counter!(
        "proxy_route_misses_total",
        "Sniffed domains with no matching route"
    );
    describe_counter!(
        "proxy_dial_failures_total",
        "Connections dropped because no upstream answered"
    );
    describe_counter!("proxy_bytes_sent_total", "Bytes pumped client -> upstream");
    describe_counter!(
        "proxy_bytes_received_total",
        "Bytes pumped upstream -> client"
    );
    describe_gauge!("proxy_active_links", "Live proxied connections");
}

/// Start Prometheus metrics server on given address
pub fn start_metrics_server(addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: std::net::SocketAddr = addr.parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    init_metrics();

    Ok(())
}

pub struct Metrics;

impl Metrics {
    #[inline]
    pub fn record_sniff_failure(kind: &'static str) {
        counter!("proxy_sniff_failures_total", "kind" => kind).increment(1);
    }

    #[inline]
    pub fn record_route_miss(listen: &str) {
        counter!("proxy_route_misses_total", "listener" => listen.to_string()).increment(1);
    }

    #[inline]
    pub fn record_dial_failure(domain: &str) {
        counter!("proxy_dial_failures_total", "domain" => domain.to_string()).increment(1);
    }

    #[inline]
    pub fn record_opened(listen: &str, domain: &str) {
        let labels = [
            ("listener", listen.to_string()),
            ("domain", domain.to_string()),
        ];
        counter!("proxy_connections_opened_total", &labels).increment(1);
        gauge!("proxy_active_links").increment(1.0);
    }

    #[inline]
    pub fn record_closed(listen: &str, domain: &str) {
        let labels = [
            ("listener", listen.to_string()),
            ("domain", domain.to_string()),
        ];
        counter!("proxy_connections_closed_total", &labels).increment(1);
        gauge!("proxy_active_links").decrement(1.0);
    }

    #[inline]
    pub fn record_bytes(sent: u64, received: u64) {
        counter!("proxy_bytes_sent_total").increment(sent);
        counter!("proxy_bytes_received_total").increment(received);
    }
}
