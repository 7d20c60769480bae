use std::fmt;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Direction tag for mid-stream pump failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    ClientToUpstream,
    UpstreamToClient,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::ClientToUpstream => write!(f, "client->upstream"),
            Side::UpstreamToClient => write!(f, "upstream->client"),
        }
    }
}

/// Errors raised by route construction and the per-connection data plane.
///
/// Only `ConfigConflict`, `InvalidAddress` and `Bind` ever reach the control
/// plane; everything else is logged and counted at the connection task.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("config conflict: {0}")]
    ConfigConflict(String),

    #[error("invalid {what} address '{addr}'")]
    InvalidAddress { what: &'static str, addr: String },

    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("unrecognized protocol preamble")]
    UnrecognizedProtocol,

    #[error("not a TLS handshake")]
    NotTls,

    #[error("client hello spans multiple TLS records")]
    TlsFragmented,

    #[error("no Host header in request")]
    NoHost,

    #[error("no server_name extension in client hello")]
    NoSni,

    #[error("timed out sniffing client preamble")]
    SniffTimeout,

    #[error("client preamble exceeded sniff limit")]
    SniffOverflow,

    #[error("i/o while sniffing: {0}")]
    SniffIo(#[source] io::Error),

    #[error("no route for domain '{0}'")]
    RouteNotFound(String),

    #[error("all upstreams for '{domain}' failed: {source}")]
    NoUpstream {
        domain: String,
        #[source]
        source: io::Error,
    },

    #[error("proxy preamble write failed: {0}")]
    UpstreamWriteFailure(#[source] io::Error),

    #[error("{side} i/o error: {source}")]
    PumpIo {
        side: Side,
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    /// Short stable label used for metrics and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            ProxyError::ConfigConflict(_) => "config_conflict",
            ProxyError::InvalidAddress { .. } => "invalid_address",
            ProxyError::Bind { .. } => "bind",
            ProxyError::UnrecognizedProtocol => "unrecognized_protocol",
            ProxyError::NotTls => "not_tls",
            ProxyError::TlsFragmented => "tls_fragmented",
            ProxyError::NoHost => "no_host",
            ProxyError::NoSni => "no_sni",
            ProxyError::SniffTimeout => "sniff_timeout",
            ProxyError::SniffOverflow => "sniff_overflow",
            ProxyError::SniffIo(_) => "sniff_io",
            ProxyError::RouteNotFound(_) => "route_not_found",
            ProxyError::NoUpstream { .. } => "no_upstream",
            ProxyError::UpstreamWriteFailure(_) => "upstream_write",
            ProxyError::PumpIo { .. } => "pump_io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_display() {
        assert_eq!(Side::ClientToUpstream.to_string(), "client->upstream");
        assert_eq!(Side::UpstreamToClient.to_string(), "upstream->client");
    }

    #[test]
    fn test_labels_are_stable() {
        assert_eq!(ProxyError::NoHost.label(), "no_host");
        assert_eq!(ProxyError::SniffOverflow.label(), "sniff_overflow");
        assert_eq!(
            ProxyError::RouteNotFound("x".into()).label(),
            "route_not_found"
        );
    }

    #[test]
    fn test_pump_error_carries_side() {
        let err = ProxyError::PumpIo {
            side: Side::UpstreamToClient,
            source: io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        };
        assert_eq!(err.label(), "pump_io");
        assert!(err.to_string().starts_with("upstream->client"));
    }

    #[test]
    fn test_bind_error_names_the_address() {
        let err = ProxyError::Bind {
            addr: "127.0.0.1:80".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("127.0.0.1:80"));
    }
}
