use anyhow::bail;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,

    #[serde(rename = "reverseProxy", default)]
    pub reverse_proxy: ReverseProxy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminConfig {
    #[serde(default = "default_admin_address")]
    pub address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            address: default_admin_address(),
        }
    }
}

fn default_admin_address() -> String {
    "127.0.0.1:9618".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// The `reverseProxy` section: the whole routed surface of the proxy.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ReverseProxy {
    #[serde(default)]
    pub disable: bool,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// One configured listener: a `(ip, port)` acceptor with domain routes.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub disable: bool,

    /// Incoming connections carry TLS; sniff SNI instead of a Host header.
    #[serde(default)]
    pub tls: bool,

    /// Listen address; empty means every local address.
    #[serde(default)]
    pub ip: String,

    /// Listen port, decimal string in [1, 65535].
    pub port: String,

    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// One domain route of a listener.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TargetConfig {
    #[serde(default)]
    pub id: String,

    pub domain: String,

    pub ip: String,

    pub port: String,

    /// 0 = raw splice; 1 = write a PROXY v1 preamble before client bytes.
    #[serde(default)]
    pub version: u8,

    #[serde(default)]
    pub disable: bool,

    #[serde(default)]
    pub spares: Vec<SpareConfig>,
}

/// Failover endpoint tried in declaration order after the primary.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SpareConfig {
    pub ip: String,
    pub port: String,
}

/// Parses a decimal port string, rejecting 0.
pub fn parse_port(port: &str) -> Option<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(p) => Some(p),
    }
}

impl Config {
    /// Document used when no config file exists yet.
    pub fn initial() -> Self {
        Self {
            reverse_proxy: ReverseProxy {
                disable: false,
                servers: vec![
                    ServerConfig {
                        id: Uuid::new_v4().to_string(),
                        name: "http".to_string(),
                        disable: true,
                        tls: false,
                        ip: String::new(),
                        port: "80".to_string(),
                        targets: Vec::new(),
                    },
                    ServerConfig {
                        id: Uuid::new_v4().to_string(),
                        name: "https".to_string(),
                        disable: true,
                        tls: true,
                        ip: String::new(),
                        port: "443".to_string(),
                        targets: Vec::new(),
                    },
                ],
            },
            ..Default::default()
        }
    }

    /// Backfills missing server/target ids. Returns true if anything changed.
    pub fn ensure_ids(&mut self) -> bool {
        let mut changed = false;
        for server in &mut self.reverse_proxy.servers {
            if server.id.is_empty() {
                server.id = Uuid::new_v4().to_string();
                changed = true;
            }
            for target in &mut server.targets {
                if target.id.is_empty() {
                    target.id = Uuid::new_v4().to_string();
                    changed = true;
                }
            }
        }
        changed
    }
}

impl ReverseProxy {
    pub fn server(&self, id: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn server_mut(&mut self, id: &str) -> Option<&mut ServerConfig> {
        self.servers.iter_mut().find(|s| s.id == id)
    }

    pub fn add_server(&mut self, server: ServerConfig) -> anyhow::Result<()> {
        if let Some(existing) = self
            .servers
            .iter()
            .find(|s| s.listen_key() == server.listen_key())
        {
            bail!(
                "listen address '{}' already used by server '{}'",
                server.listen_key(),
                existing.name
            );
        }
        self.servers.push(server);
        Ok(())
    }

    pub fn delete_server(&mut self, id: &str) -> anyhow::Result<()> {
        let before = self.servers.len();
        self.servers.retain(|s| s.id != id);
        if self.servers.len() == before {
            bail!("server id '{}' not existed", id);
        }
        Ok(())
    }

    pub fn modify_server(&mut self, edit: &ServerConfig) -> anyhow::Result<()> {
        if let Some(existing) = self
            .servers
            .iter()
            .find(|s| s.id != edit.id && s.listen_key() == edit.listen_key())
        {
            bail!(
                "listen address '{}' already used by server '{}'",
                edit.listen_key(),
                existing.name
            );
        }
        let Some(server) = self.server_mut(&edit.id) else {
            bail!("server id '{}' not existed", edit.id);
        };
        server.name = edit.name.clone();
        server.disable = edit.disable;
        server.tls = edit.tls;
        server.ip = edit.ip.clone();
        server.port = edit.port.clone();
        Ok(())
    }
}

impl ServerConfig {
    /// The unique listener key: `ip:port` as written in the document.
    pub fn listen_key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn add_target(&mut self, target: TargetConfig) -> anyhow::Result<()> {
        if self
            .targets
            .iter()
            .any(|t| t.domain.eq_ignore_ascii_case(&target.domain))
        {
            bail!("domain '{}' has been existed", target.domain);
        }
        self.targets.push(target);
        Ok(())
    }

    pub fn delete_target(&mut self, target_id: &str) -> anyhow::Result<()> {
        let before = self.targets.len();
        self.targets.retain(|t| t.id != target_id);
        if self.targets.len() == before {
            bail!("target id '{}' not existed", target_id);
        }
        Ok(())
    }

    pub fn modify_target(&mut self, edit: &TargetConfig) -> anyhow::Result<()> {
        if self
            .targets
            .iter()
            .any(|t| t.id != edit.id && t.domain.eq_ignore_ascii_case(&edit.domain))
        {
            bail!("domain '{}' has been existed", edit.domain);
        }
        let Some(target) = self.targets.iter_mut().find(|t| t.id == edit.id) else {
            bail!("target id '{}' not existed", edit.id);
        };
        target.domain = edit.domain.clone();
        target.ip = edit.ip.clone();
        target.port = edit.port.clone();
        target.version = edit.version;
        target.disable = edit.disable;
        target.spares = edit.spares.clone();
        Ok(())
    }
}
