use crate::config::{parse_port, Config};
use crate::error::ProxyError;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Immutable routing snapshot derived from the configuration document.
///
/// Construction is a pure transformation: disabled servers and targets are
/// filtered out, addresses are resolved to socket addresses, and the result
/// is value-semantic and safe to share across tasks. Nothing downstream ever
/// sees a disabled entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteTable {
    listeners: HashMap<SocketAddr, ListenerSpec>,
}

/// One listener's slice of the table.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerSpec {
    pub addr: SocketAddr,
    pub tls: bool,
    /// Lowercased domain -> target.
    pub routes: HashMap<String, Target>,
}

/// Upstream selected by domain at route time.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub primary: SocketAddr,
    pub spares: Vec<SocketAddr>,
    /// 0 = raw splice; 1 = PROXY v1 preamble before client bytes.
    pub proxy_version: u8,
}

impl RouteTable {
    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        let mut listeners: HashMap<SocketAddr, ListenerSpec> = HashMap::new();

        for server in &config.reverse_proxy.servers {
            if server.disable {
                continue;
            }

            let addr = listen_endpoint(&server.ip, &server.port)?;
            if listeners.contains_key(&addr) {
                return Err(ProxyError::ConfigConflict(format!(
                    "duplicate listener {addr}"
                )));
            }

            let mut routes = HashMap::new();
            for target in &server.targets {
                if target.disable {
                    continue;
                }

                let domain = target.domain.trim().to_ascii_lowercase();
                if domain.is_empty() {
                    return Err(ProxyError::ConfigConflict(format!(
                        "server '{}' has a target without a domain",
                        server.name
                    )));
                }
                if routes.contains_key(&domain) {
                    return Err(ProxyError::ConfigConflict(format!(
                        "duplicate domain '{domain}' on listener {addr}"
                    )));
                }

                let primary = target_endpoint(&target.ip, &target.port)?;
                let spares = target
                    .spares
                    .iter()
                    .map(|s| target_endpoint(&s.ip, &s.port))
                    .collect::<Result<Vec<_>, _>>()?;

                routes.insert(
                    domain,
                    Target {
                        primary,
                        spares,
                        proxy_version: target.version,
                    },
                );
            }

            listeners.insert(
                addr,
                ListenerSpec {
                    addr,
                    tls: server.tls,
                    routes,
                },
            );
        }

        Ok(Self { listeners })
    }

    pub fn listeners(&self) -> &HashMap<SocketAddr, ListenerSpec> {
        &self.listeners
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&ListenerSpec> {
        self.listeners.get(addr)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Listen addresses accept an empty ip as "every local address".
fn listen_endpoint(ip: &str, port: &str) -> Result<SocketAddr, ProxyError> {
    endpoint(ip, port, "listen", true)
}

fn target_endpoint(ip: &str, port: &str) -> Result<SocketAddr, ProxyError> {
    endpoint(ip, port, "target", false)
}

fn endpoint(
    ip: &str,
    port: &str,
    what: &'static str,
    allow_empty_ip: bool,
) -> Result<SocketAddr, ProxyError> {
    let invalid = || ProxyError::InvalidAddress {
        what,
        addr: format!("{ip}:{port}"),
    };

    let port = parse_port(port).ok_or_else(|| invalid())?;
    let ip = ip.trim();
    let ip_addr: IpAddr = if ip.is_empty() {
        if !allow_empty_ip {
            return Err(invalid());
        }
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        ip.parse().map_err(|_| invalid())?
    };

    Ok(SocketAddr::new(ip_addr, port))
}
