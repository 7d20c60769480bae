use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{body::Incoming, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::admin::ws;
use crate::config::{parse_port, ConfigStore, ServerConfig, TargetConfig};
use crate::engine::Engine;
use crate::events::{EventBus, ProxyEvent, ServerDeleted, TargetChange, TargetDeleted};
use crate::proxy::LinkFilter;

/// Management API: CRUD over the configuration document, service control,
/// and the live connection listing. Every successful mutation persists the
/// document, reconciles the engine, and publishes an event.
pub struct AdminApi {
    store: Arc<ConfigStore>,
    engine: Arc<Engine>,
    events: EventBus,
}

enum ApiError {
    Input(String),
    Internal(String),
    NotFound,
}

type ApiResult = Result<Value, ApiError>;

impl AdminApi {
    pub fn new(store: Arc<ConfigStore>, engine: Arc<Engine>, events: EventBus) -> Self {
        Self {
            store,
            engine,
            events,
        }
    }

    /// Handle a management request
    pub async fn handle(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        if method == hyper::Method::GET {
            if path == "/ping" {
                return self.ping();
            }
            if path == "/proxy/ws" && ws::is_websocket_upgrade(&req) {
                return ws::handle_upgrade(req, self.events.clone());
            }
            return self.respond(Err(ApiError::NotFound));
        }

        if method != hyper::Method::POST {
            return self.respond(Err(ApiError::NotFound));
        }

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return self.respond(Err(ApiError::Input(format!("failed to read body: {e}"))));
            }
        };

        let result = self.dispatch(&path, &body).await;
        self.respond(result)
    }

    async fn dispatch(&self, path: &str, body: &[u8]) -> ApiResult {
        match path {
            "/proxy/service/setting/get" => self.service_setting_get(),
            "/proxy/service/setting/set" => self.service_setting_set(parse_body(body)?).await,
            "/proxy/service/status" => Ok(to_value(self.engine.status().await)),
            "/proxy/service/start" => self.service_start().await,
            "/proxy/service/stop" => self.service_stop().await,
            "/proxy/service/restart" => self.service_restart().await,
            "/proxy/conn/list" => self.conn_list(body),
            "/proxy/server/list" => self.server_list(),
            "/proxy/server/add" => self.server_add(parse_body(body)?).await,
            "/proxy/server/del" => self.server_del(parse_body(body)?).await,
            "/proxy/server/mod" => self.server_mod(parse_body(body)?).await,
            "/proxy/target/list" => self.target_list(parse_body(body)?),
            "/proxy/target/add" => self.target_add(parse_body(body)?).await,
            "/proxy/target/del" => self.target_del(parse_body(body)?).await,
            "/proxy/target/mod" => self.target_mod(parse_body(body)?).await,
            _ => Err(ApiError::NotFound),
        }
    }

    // =========================================================================
    // Service control
    // =========================================================================

    fn service_setting_get(&self) -> ApiResult {
        Ok(to_value(ServiceSetting {
            disable: self.store.get().reverse_proxy.disable,
        }))
    }

    async fn service_setting_set(&self, setting: ServiceSetting) -> ApiResult {
        if setting.disable == self.store.get().reverse_proxy.disable {
            return Ok(to_value(setting));
        }

        self.store
            .update(|cfg| {
                cfg.reverse_proxy.disable = setting.disable;
                Ok(())
            })
            .map_err(classify)?;

        if setting.disable {
            info!("Reverse proxy disabled via API, stopping engine");
            self.engine.stop().await;
        }

        Ok(to_value(setting))
    }

    async fn service_start(&self) -> ApiResult {
        self.ensure_enabled()?;
        self.engine
            .start()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(Value::Null)
    }

    async fn service_stop(&self) -> ApiResult {
        self.ensure_enabled()?;
        self.engine.stop().await;
        Ok(Value::Null)
    }

    async fn service_restart(&self) -> ApiResult {
        self.ensure_enabled()?;
        self.engine
            .restart()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(Value::Null)
    }

    fn ensure_enabled(&self) -> Result<(), ApiError> {
        if self.store.get().reverse_proxy.disable {
            return Err(ApiError::Input("service is disabled".to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Connections
    // =========================================================================

    fn conn_list(&self, body: &[u8]) -> ApiResult {
        let filter: LinkFilter = if body.is_empty() {
            LinkFilter::default()
        } else {
            parse_body(body)?
        };
        Ok(to_value(self.engine.registry().list(&filter)))
    }

    // =========================================================================
    // Servers
    // =========================================================================

    fn server_list(&self) -> ApiResult {
        let servers: Vec<ServerSummary> = self
            .store
            .get()
            .reverse_proxy
            .servers
            .iter()
            .map(ServerSummary::from)
            .collect();
        Ok(to_value(servers))
    }

    async fn server_add(&self, arg: ServerSummary) -> ApiResult {
        validate_server(&arg)?;

        let server = ServerConfig {
            id: Uuid::new_v4().to_string(),
            name: arg.name,
            disable: arg.disable,
            tls: arg.tls,
            ip: arg.ip,
            port: arg.port,
            targets: Vec::new(),
        };

        let added = self
            .store
            .update(|cfg| {
                cfg.reverse_proxy.add_server(server.clone())?;
                Ok(server.clone())
            })
            .map_err(classify)?;

        self.reconcile().await?;
        self.events.publish(ProxyEvent::ServerAdded(added));
        Ok(Value::Null)
    }

    async fn server_del(&self, arg: IdArg) -> ApiResult {
        require(!arg.id.is_empty(), "id is empty")?;

        self.store
            .update(|cfg| cfg.reverse_proxy.delete_server(&arg.id))
            .map_err(classify)?;

        self.reconcile().await?;
        self.events
            .publish(ProxyEvent::ServerDeleted(ServerDeleted { id: arg.id }));
        Ok(Value::Null)
    }

    async fn server_mod(&self, arg: ServerSummary) -> ApiResult {
        require(!arg.id.is_empty(), "id is empty")?;
        validate_server(&arg)?;

        let edit = ServerConfig {
            id: arg.id,
            name: arg.name,
            disable: arg.disable,
            tls: arg.tls,
            ip: arg.ip,
            port: arg.port,
            targets: Vec::new(),
        };

        let modified = self
            .store
            .update(|cfg| {
                cfg.reverse_proxy.modify_server(&edit)?;
                Ok(cfg
                    .reverse_proxy
                    .server(&edit.id)
                    .cloned()
                    .expect("server modified above"))
            })
            .map_err(classify)?;

        self.reconcile().await?;
        self.events.publish(ProxyEvent::ServerModified(modified));
        Ok(Value::Null)
    }

    // =========================================================================
    // Targets
    // =========================================================================

    fn target_list(&self, arg: IdArg) -> ApiResult {
        require(!arg.id.is_empty(), "id is empty")?;

        let config = self.store.get();
        let Some(server) = config.reverse_proxy.server(&arg.id) else {
            return Err(ApiError::Input(format!("server id '{}' not exist", arg.id)));
        };
        Ok(to_value(&server.targets))
    }

    async fn target_add(&self, mut arg: TargetEdit) -> ApiResult {
        require(!arg.server_id.is_empty(), "server id is empty")?;
        validate_target(&arg.target)?;

        arg.target.id = Uuid::new_v4().to_string();
        let server_id = arg.server_id.clone();
        let target = arg.target.clone();

        self.store
            .update(|cfg| {
                let Some(server) = cfg.reverse_proxy.server_mut(&server_id) else {
                    anyhow::bail!("server id '{}' not exist", server_id);
                };
                server.add_target(target.clone())
            })
            .map_err(classify)?;

        self.reconcile().await?;
        self.events.publish(ProxyEvent::TargetAdded(TargetChange {
            server_id: arg.server_id,
            target: arg.target,
        }));
        Ok(Value::Null)
    }

    async fn target_del(&self, arg: TargetDel) -> ApiResult {
        require(!arg.server_id.is_empty(), "server id is empty")?;
        require(!arg.target_id.is_empty(), "target id is empty")?;

        let server_id = arg.server_id.clone();
        let target_id = arg.target_id.clone();
        self.store
            .update(|cfg| {
                let Some(server) = cfg.reverse_proxy.server_mut(&server_id) else {
                    anyhow::bail!("server id '{}' not exist", server_id);
                };
                server.delete_target(&target_id)
            })
            .map_err(classify)?;

        self.reconcile().await?;
        self.events.publish(ProxyEvent::TargetDeleted(TargetDeleted {
            server_id: arg.server_id,
            target_id: arg.target_id,
        }));
        Ok(Value::Null)
    }

    async fn target_mod(&self, arg: TargetEdit) -> ApiResult {
        require(!arg.server_id.is_empty(), "server id is empty")?;
        require(!arg.target.id.is_empty(), "target id is empty")?;
        validate_target(&arg.target)?;

        let server_id = arg.server_id.clone();
        let target = arg.target.clone();
        self.store
            .update(|cfg| {
                let Some(server) = cfg.reverse_proxy.server_mut(&server_id) else {
                    anyhow::bail!("server id '{}' not exist", server_id);
                };
                server.modify_target(&target)
            })
            .map_err(classify)?;

        self.reconcile().await?;
        self.events.publish(ProxyEvent::TargetModified(TargetChange {
            server_id: arg.server_id,
            target: arg.target,
        }));
        Ok(Value::Null)
    }

    async fn reconcile(&self) -> Result<(), ApiError> {
        self.engine.reconcile().await.map_err(|e| {
            warn!("Reconcile after mutation failed: {}", e);
            ApiError::Internal(e.to_string())
        })
    }

    // =========================================================================
    // Response plumbing
    // =========================================================================

    fn respond(&self, result: ApiResult) -> Response<BoxBody<Bytes, hyper::Error>> {
        match result {
            Ok(data) => self.json_response(StatusCode::OK, &json!({ "code": 0, "data": data })),
            Err(ApiError::Input(msg)) => self.json_response(
                StatusCode::BAD_REQUEST,
                &json!({ "code": 400, "error": msg }),
            ),
            Err(ApiError::Internal(msg)) => self.json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({ "code": 500, "error": msg }),
            ),
            Err(ApiError::NotFound) => self.json_response(
                StatusCode::NOT_FOUND,
                &json!({ "code": 404, "error": "Not Found" }),
            ),
        }
    }

    fn ping(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(full_body("OK"))
            .unwrap()
    }

    fn json_response(
        &self,
        status: StatusCode,
        data: &Value,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(data.to_string()))
            .unwrap()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServiceSetting {
    disable: bool,
}

#[derive(Debug, Deserialize)]
struct IdArg {
    id: String,
}

/// A server as listed and edited over the API: everything but its targets.
#[derive(Debug, Serialize, Deserialize)]
struct ServerSummary {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    disable: bool,
    #[serde(default)]
    tls: bool,
    #[serde(default)]
    ip: String,
    port: String,
}

impl From<&ServerConfig> for ServerSummary {
    fn from(server: &ServerConfig) -> Self {
        Self {
            id: server.id.clone(),
            name: server.name.clone(),
            disable: server.disable,
            tls: server.tls,
            ip: server.ip.clone(),
            port: server.port.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetEdit {
    server_id: String,
    target: TargetConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetDel {
    server_id: String,
    target_id: String,
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::Input(format!("invalid request: {e}")))
}

fn to_value<T: Serialize>(data: T) -> Value {
    serde_json::to_value(data).unwrap_or(Value::Null)
}

fn require(cond: bool, msg: &str) -> Result<(), ApiError> {
    if cond {
        Ok(())
    } else {
        Err(ApiError::Input(msg.to_string()))
    }
}

/// Persistence failures are io-rooted and internal; everything else coming
/// out of a mutation is bad input.
fn classify(e: anyhow::Error) -> ApiError {
    if e.root_cause().downcast_ref::<std::io::Error>().is_some() {
        ApiError::Internal(format!("{e:#}"))
    } else {
        ApiError::Input(format!("{e:#}"))
    }
}

fn validate_server(arg: &ServerSummary) -> Result<(), ApiError> {
    require(!arg.name.is_empty(), "name is empty")?;
    validate_endpoint(&arg.ip, &arg.port, true)
}

fn validate_target(target: &TargetConfig) -> Result<(), ApiError> {
    require(!target.domain.trim().is_empty(), "domain is empty")?;
    validate_endpoint(&target.ip, &target.port, false)?;
    require(
        target.version <= 1,
        &format!("version ({}) invalid", target.version),
    )?;
    for spare in &target.spares {
        require(!spare.ip.is_empty(), "spare ip is empty")?;
        validate_endpoint(&spare.ip, &spare.port, false)?;
    }
    Ok(())
}

fn validate_endpoint(ip: &str, port: &str, allow_empty_ip: bool) -> Result<(), ApiError> {
    if ip.is_empty() {
        require(allow_empty_ip, "ip is empty")?;
    } else if ip.parse::<IpAddr>().is_err() {
        return Err(ApiError::Input(format!("ip ({ip}) invalid")));
    }
    require(!port.is_empty(), "port is empty")?;
    require(
        parse_port(port).is_some(),
        &format!("port ({port}) invalid"),
    )?;
    Ok(())
}

fn full_body<T: Into<Bytes>>(content: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("", "80", true).is_ok());
        assert!(validate_endpoint("", "80", false).is_err());
        assert!(validate_endpoint("192.168.1.8", "8080", false).is_ok());
        assert!(validate_endpoint("not-an-ip", "8080", false).is_err());
        assert!(validate_endpoint("192.168.1.8", "0", false).is_err());
        assert!(validate_endpoint("192.168.1.8", "", false).is_err());
        assert!(validate_endpoint("::1", "443", false).is_ok());
    }

    #[test]
    fn test_validate_target_checks_spares() {
        let mut target = TargetConfig {
            id: "t1".to_string(),
            domain: "test.com".to_string(),
            ip: "192.168.1.8".to_string(),
            port: "8080".to_string(),
            ..Default::default()
        };
        assert!(validate_target(&target).is_ok());

        target.spares.push(crate::config::SpareConfig {
            ip: "192.168.1.18".to_string(),
            port: "99999".to_string(),
        });
        assert!(validate_target(&target).is_err());
    }

    #[test]
    fn test_validate_target_version_range() {
        let target = TargetConfig {
            id: "t1".to_string(),
            domain: "test.com".to_string(),
            ip: "192.168.1.8".to_string(),
            port: "8080".to_string(),
            version: 2,
            ..Default::default()
        };
        assert!(validate_target(&target).is_err());
    }

    #[test]
    fn test_classify_errors() {
        let input = anyhow::anyhow!("domain 'x' has been existed");
        assert!(matches!(classify(input), ApiError::Input(_)));

        let io = anyhow::Error::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(matches!(classify(io), ApiError::Internal(_)));
    }
}
