//! HTTP surface under `/api`
//!
//! Handlers are thin: they decode the request, hand the work to the shared [`Services`] and
//! wrap the answer. Failures come back as an [`ErrorPayload`] with a status derived from the
//! error class.
//!
//! Scans and framework calls run on their own task so a client hanging up mid-request cannot
//! leave a scan job `running` or abandon an RPC exchange halfway.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{future::Future, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    core::{latest_hosts, RecordId, Services},
    error::{ErrorPayload, ReconError, Result},
    metasploit::{FrameworkScanKind, ModuleType},
    profiler::VulnScanLevel,
    rpc::RpcCredentials,
};

type SharedServices = State<Arc<Services>>;
type ApiResult = std::result::Result<Json<Value>, ApiError>;

/// Failure answered to an HTTP client
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    payload: ErrorPayload,
}

impl ApiError {
    fn new(message: &str, error: ReconError) -> Self {
        let status = status_for(&error);
        if status.is_server_error() {
            warn!(severity = %error.severity(), "{}: {}", message, error);
        }
        Self {
            status,
            payload: ErrorPayload::new(message, &error),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.payload)).into_response()
    }
}

fn status_for(error: &ReconError) -> StatusCode {
    match error {
        ReconError::InvalidTarget { .. } | ReconError::Validation { .. } | ReconError::Configuration { .. } => {
            StatusCode::BAD_REQUEST
        }
        ReconError::NotFound { .. } => StatusCode::NOT_FOUND,
        e if e.is_auth_error() => StatusCode::UNAUTHORIZED,
        ReconError::RpcProtocol { .. }
        | ReconError::ConnectionClosed
        | ReconError::Network { .. }
        | ReconError::Codec { .. } => StatusCode::BAD_GATEWAY,
        ReconError::SubprocessTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failed(message: &'static str) -> impl FnOnce(ReconError) -> ApiError {
    move |error| ApiError::new(message, error)
}

/// Run `work` to completion even if the request future is dropped
async fn detached<T, F>(work: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| ReconError::internal("request task", e.to_string()))?
}

fn required(field: &str, value: Option<String>) -> Result<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ReconError::validation(field, format!("{} is required", field)))
}

pub fn router(services: Arc<Services>) -> Router {
    let api = Router::new()
        .route("/scan/network", post(scan_network))
        .route("/scan/device", post(scan_device))
        .route("/scan/vulnerabilities", post(scan_vulnerabilities))
        .route("/network/interfaces", get(list_interfaces))
        .route("/devices", get(list_devices))
        .route("/devices/:id", get(get_device))
        .route("/devices/:id/vulnerabilities", get(device_vulnerabilities))
        .route("/vulnerabilities", get(list_vulnerabilities))
        .route("/settings", get(list_settings).post(save_setting))
        .route("/metasploit/init-db", post(framework_init_db))
        .route("/metasploit/connect", post(framework_connect))
        .route("/metasploit/status", get(framework_status))
        .route("/metasploit/execute", post(framework_execute))
        .route("/metasploit/scan", post(framework_scan))
        .route("/metasploit/sessions", get(framework_sessions))
        .route("/metasploit/modules", get(framework_modules))
        .route("/capture/start", post(start_capture))
        .route("/capture/stop", post(stop_capture))
        .route("/capture/active", get(active_captures))
        .route("/metrics", get(metrics_snapshot));

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(services)
}

/// Serve the API until Ctrl-C
pub async fn serve(services: Arc<Services>, bind: &str) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| ReconError::network(format!("failed to bind {}: {}", bind, e)))?;
    info!("HTTP API listening on http://{}", bind);

    axum::serve(listener, router(services))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down HTTP API");
        })
        .await
        .map_err(|e| ReconError::io("serve HTTP API", e.to_string()))
}

#[derive(Debug, Deserialize)]
struct NetworkScanRequest {
    cidr: Option<String>,
    ports: Option<String>,
}

async fn scan_network(State(services): SharedServices, Json(body): Json<NetworkScanRequest>) -> ApiResult {
    let cidr = required("cidr", body.cidr).map_err(failed("Failed to scan network"))?;
    let options = crate::profiler::ProfileOptions { ports: body.ports };
    let summary = detached(async move { services.orchestrator.scan_network_with(&cidr, &options).await })
        .await
        .map_err(failed("Failed to scan network"))?;
    Ok(Json(json!({
        "success": true,
        "sessionId": summary.scan_job_id,
        "devicesFound": summary.devices_found,
        "devices": summary.hosts,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceScanRequest {
    ip_address: Option<String>,
    ports: Option<String>,
}

async fn scan_device(State(services): SharedServices, Json(body): Json<DeviceScanRequest>) -> ApiResult {
    let ip = required("ipAddress", body.ip_address).map_err(failed("Failed to scan device"))?;
    let options = crate::profiler::ProfileOptions { ports: body.ports };
    let result = detached(async move { services.orchestrator.scan_device_with(&ip, &options).await })
        .await
        .map_err(failed("Failed to scan device"))?;
    Ok(Json(json!({
        "success": true,
        "sessionId": result.scan_job_id,
        "isOnline": result.is_online,
        "device": result.device,
        "ports": result.ports,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VulnScanRequest {
    ip_address: Option<String>,
    level: Option<String>,
}

async fn scan_vulnerabilities(State(services): SharedServices, Json(body): Json<VulnScanRequest>) -> ApiResult {
    let fail = "Failed to scan for vulnerabilities";
    let ip = required("ipAddress", body.ip_address).map_err(failed(fail))?;
    let level = match body.level.as_deref() {
        None => VulnScanLevel::Basic,
        Some(raw) => VulnScanLevel::from_str(raw)
            .ok_or_else(|| ReconError::validation("level", "level must be basic or deep"))
            .map_err(failed(fail))?,
    };
    let result = detached(async move { services.orchestrator.vuln_scan(&ip, level).await })
        .await
        .map_err(failed(fail))?;
    Ok(Json(json!({
        "success": true,
        "sessionId": result.scan_job_id,
        "hostId": result.host_id,
        "vulnerabilitiesFound": result.vulnerabilities_found,
        "vulnerabilities": result.vulnerabilities,
    })))
}

async fn list_interfaces(State(services): SharedServices) -> ApiResult {
    let interfaces = services
        .interfaces
        .interfaces()
        .map_err(failed("Failed to list network interfaces"))?;
    Ok(Json(json!(interfaces)))
}

async fn list_devices(State(services): SharedServices) -> ApiResult {
    let hosts = services.records.list_hosts().await.map_err(failed("Failed to list devices"))?;
    Ok(Json(json!(latest_hosts(hosts))))
}

async fn get_device(State(services): SharedServices, Path(id): Path<RecordId>) -> ApiResult {
    let fail = "Failed to get device";
    let host = services
        .records
        .get_host(id)
        .await
        .and_then(|host| host.ok_or_else(|| ReconError::not_found("device", id)))
        .map_err(failed(fail))?;
    let ports = services.records.ports_for_host(id).await.map_err(failed(fail))?;

    let mut device = serde_json::to_value(host).map_err(|e| ApiError::new(fail, e.into()))?;
    device["ports"] = json!(ports);
    Ok(Json(device))
}

async fn device_vulnerabilities(State(services): SharedServices, Path(id): Path<RecordId>) -> ApiResult {
    let fail = "Failed to get device vulnerabilities";
    if services.records.get_host(id).await.map_err(failed(fail))?.is_none() {
        return Err(ApiError::new(fail, ReconError::not_found("device", id)));
    }
    let vulns = services.records.vulnerabilities_for_host(id).await.map_err(failed(fail))?;
    Ok(Json(json!(vulns)))
}

async fn list_vulnerabilities(State(services): SharedServices) -> ApiResult {
    let vulns = services
        .records
        .list_vulnerabilities()
        .await
        .map_err(failed("Failed to list vulnerabilities"))?;
    Ok(Json(json!(vulns)))
}

async fn list_settings(State(services): SharedServices) -> ApiResult {
    let settings = services.settings.list_settings().await.map_err(failed("Failed to get settings"))?;
    let masked: Vec<_> = settings.iter().map(|s| s.masked()).collect();
    Ok(Json(json!(masked)))
}

#[derive(Debug, Deserialize)]
struct SettingRequest {
    key: Option<String>,
    value: Option<String>,
}

async fn save_setting(State(services): SharedServices, Json(body): Json<SettingRequest>) -> ApiResult {
    let fail = "Failed to save setting";
    let key = required("key", body.key).map_err(failed(fail))?;
    let value = body.value.unwrap_or_default();
    services.settings.set_setting(&key, &value).await.map_err(failed(fail))?;
    Ok(Json(json!({ "success": true, "key": key })))
}

#[derive(Debug, Default, Deserialize)]
struct ConnectionRequest {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
}

impl ConnectionRequest {
    fn is_empty(&self) -> bool {
        self.host.is_none() && self.port.is_none() && self.username.is_none() && self.password.is_none()
    }

    fn into_credentials(self) -> Result<RpcCredentials> {
        match (self.host, self.port, self.username, self.password) {
            (Some(host), Some(port), Some(username), Some(password)) => Ok(RpcCredentials {
                host,
                port,
                username,
                password,
            }),
            _ => Err(ReconError::validation(
                "connection",
                "host, port, username and password are all required",
            )),
        }
    }
}

async fn framework_init_db(State(services): SharedServices, Json(body): Json<ConnectionRequest>) -> ApiResult {
    let fail = "Failed to initialize framework connection";
    let credentials = body.into_credentials().map_err(failed(fail))?;
    let status = detached(async move {
        services.framework.init_db(credentials).await?;
        services.framework.status().await
    })
    .await
    .map_err(failed(fail))?;
    Ok(Json(json!({ "success": true, "message": "Framework connection saved", "status": status })))
}

/// Connect with the given credentials, or with the stored ones when the body is empty
async fn framework_connect(
    State(services): SharedServices,
    body: Option<Json<ConnectionRequest>>,
) -> ApiResult {
    let fail = "Failed to connect to framework";
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let credentials = if body.is_empty() {
        None
    } else {
        Some(body.into_credentials().map_err(failed(fail))?)
    };
    let status = detached(async move {
        match credentials {
            Some(credentials) => services.framework.connect(credentials).await?,
            None => services.framework.ensure_connected().await?,
        }
        services.framework.status().await
    })
    .await
    .map_err(failed(fail))?;
    Ok(Json(json!({ "success": true, "status": status })))
}

async fn framework_status(State(services): SharedServices) -> ApiResult {
    let status = detached(async move { services.framework.status().await })
        .await
        .map_err(failed("Failed to get framework status"))?;
    Ok(Json(json!(status)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest {
    command: Option<String>,
    module_type: Option<String>,
    module_name: Option<String>,
    #[serde(default)]
    options: serde_json::Map<String, Value>,
}

async fn framework_execute(State(services): SharedServices, Json(body): Json<ExecuteRequest>) -> ApiResult {
    let fail = "Failed to execute framework command";
    let cancel = CancellationToken::new();

    if let Some(command) = body.command.filter(|c| !c.trim().is_empty()) {
        let output = detached(async move { services.framework.execute_command(&command, &cancel).await })
            .await
            .map_err(failed(fail))?;
        return Ok(Json(json!({
            "success": true,
            "data": {
                "output": output.output,
                "consoleId": output.console_id,
                "timedOut": output.timed_out,
            }
        })));
    }

    let (Some(module_type), Some(module_name)) = (body.module_type, body.module_name) else {
        return Err(ApiError::new(
            fail,
            ReconError::validation("command", "either command or moduleType and moduleName are required"),
        ));
    };
    let module_type = ModuleType::from_str(&module_type)
        .ok_or_else(|| ReconError::validation("moduleType", format!("unknown module type: {}", module_type)))
        .map_err(failed(fail))?;
    let options = body.options;
    let run = detached(async move {
        services
            .framework
            .execute_module(module_type, &module_name, &options, &cancel)
            .await
    })
    .await
    .map_err(failed(fail))?;
    Ok(Json(json!({ "success": true, "data": run })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameworkScanRequest {
    target: Option<String>,
    scan_type: Option<String>,
}

async fn framework_scan(State(services): SharedServices, Json(body): Json<FrameworkScanRequest>) -> ApiResult {
    let fail = "Failed to run framework scan";
    let target = required("target", body.target).map_err(failed(fail))?;
    let kind = FrameworkScanKind::from_label(body.scan_type.as_deref().unwrap_or("tcp"));
    let report = detached(async move {
        services
            .framework
            .run_scan(&target, kind, &CancellationToken::new())
            .await
    })
    .await
    .map_err(failed(fail))?;
    Ok(Json(json!({ "success": true, "data": report })))
}

async fn framework_sessions(State(services): SharedServices) -> ApiResult {
    let sessions = detached(async move { services.framework.list_sessions().await })
        .await
        .map_err(failed("Failed to list framework sessions"))?;
    Ok(Json(json!({ "success": true, "data": sessions })))
}

#[derive(Debug, Deserialize)]
struct ModulesQuery {
    #[serde(rename = "type")]
    module_type: Option<String>,
}

async fn framework_modules(State(services): SharedServices, Query(query): Query<ModulesQuery>) -> ApiResult {
    let fail = "Failed to list framework modules";
    let raw = query.module_type.unwrap_or_else(|| "exploit".to_string());
    let module_type = ModuleType::from_str(&raw)
        .ok_or_else(|| ReconError::validation("type", format!("unknown module type: {}", raw)))
        .map_err(failed(fail))?;
    let modules = detached(async move { services.framework.list_modules(module_type).await })
        .await
        .map_err(failed(fail))?;
    Ok(Json(json!({ "success": true, "type": module_type, "data": modules })))
}

#[derive(Debug, Deserialize)]
struct CaptureStartRequest {
    interface: Option<String>,
    filter: Option<String>,
}

async fn start_capture(State(services): SharedServices, Json(body): Json<CaptureStartRequest>) -> ApiResult {
    let fail = "Failed to start packet capture";
    let interface = required("interface", body.interface).map_err(failed(fail))?;
    let session = services
        .captures
        .start(&interface, body.filter.as_deref())
        .await
        .map_err(failed(fail))?;
    Ok(Json(json!({ "success": true, "sessionId": session.id, "data": session })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureStopRequest {
    session_id: Option<RecordId>,
}

async fn stop_capture(State(services): SharedServices, Json(body): Json<CaptureStopRequest>) -> ApiResult {
    let fail = "Failed to stop packet capture";
    let id = body
        .session_id
        .ok_or_else(|| ReconError::validation("sessionId", "sessionId is required"))
        .map_err(failed(fail))?;
    let session = detached(async move { services.captures.stop(id).await })
        .await
        .map_err(failed(fail))?;
    Ok(Json(json!({ "success": true, "data": session })))
}

async fn active_captures(State(services): SharedServices) -> Json<Value> {
    Json(json!({ "success": true, "data": services.captures.active().await }))
}

async fn metrics_snapshot(State(services): SharedServices) -> Json<Value> {
    Json(json!(services.metrics.snapshot()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::testing::{services, Fixture},
        persistence::{keys, SettingsStore, MASKED_SECRET},
        process::fake::ScriptedRunner,
        rpc::{
            codec,
            testing::{standard_reply, FakeFramework, Reply},
        },
    };
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    fn lan_runner() -> ScriptedRunner {
        ScriptedRunner::new()
            .respond(
                "nmap",
                &["-sn", "10.0.0.0/24"],
                "Nmap scan report for 10.0.0.1\nHost is up.\nNmap scan report for files (10.0.0.7)\nHost is up.\n",
            )
            .respond("ping", &["10.0.0.1"], "")
            .respond("ping", &["10.0.0.7"], "")
            .respond("nmap", &["10.0.0.1"], "53/tcp open domain\n")
            .respond("nmap", &["10.0.0.7"], "445/tcp open microsoft-ds\n")
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn app(f: &Fixture) -> Router {
        router(f.services.clone())
    }

    #[tokio::test]
    async fn test_network_scan_and_device_lookup() {
        let f = services(lan_runner(), FakeFramework::standard(), Vec::new());
        let app = app(&f);

        let (status, body) = send(&app, "POST", "/api/scan/network", Some(json!({ "cidr": "10.0.0.0/24" }))).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["devicesFound"], 2);
        assert!(body["sessionId"].as_u64().is_some());

        let (status, devices) = send(&app, "GET", "/api/devices", None).await;
        assert_eq!(status, StatusCode::OK);
        let devices = devices.as_array().unwrap();
        assert_eq!(devices.len(), 2);

        let id = devices[1]["id"].as_u64().unwrap();
        let (status, device) = send(&app, "GET", &format!("/api/devices/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(device["ipAddress"], "10.0.0.7");
        assert_eq!(device["ports"][0]["portNumber"], 445);

        let (status, vulns) = send(&app, "GET", &format!("/api/devices/{}/vulnerabilities", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(vulns, json!([]));
    }

    #[tokio::test]
    async fn test_invalid_cidr_is_bad_request() {
        let f = services(ScriptedRunner::new(), FakeFramework::standard(), Vec::new());
        let (status, body) = send(&app(&f), "POST", "/api/scan/network", Some(json!({ "cidr": "10.0.0.0/99" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Failed to scan network");
        assert!(f.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let f = services(ScriptedRunner::new(), FakeFramework::standard(), Vec::new());
        let app = app(&f);
        let (status, body) = send(&app, "GET", "/api/devices/404", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        let (status, _) = send(&app, "GET", "/api/devices/404/vulnerabilities", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_settings_are_masked() {
        let f = services(ScriptedRunner::new(), FakeFramework::standard(), Vec::new());
        let app = app(&f);
        let (status, _) = send(
            &app,
            "POST",
            "/api/settings",
            Some(json!({ "key": keys::METASPLOIT_PASSWORD, "value": "hunter2" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, settings) = send(&app, "GET", "/api/settings", None).await;
        let password = settings
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["key"] == keys::METASPLOIT_PASSWORD)
            .unwrap();
        assert_eq!(password["value"], MASKED_SECRET);
        assert_eq!(
            f.store.get_setting(keys::METASPLOIT_PASSWORD).await.unwrap().as_deref(),
            Some("hunter2")
        );
    }

    #[tokio::test]
    async fn test_init_db_validates_and_connects() {
        let f = services(ScriptedRunner::new(), FakeFramework::standard(), Vec::new());
        let app = app(&f);

        let (status, body) = send(&app, "POST", "/api/metasploit/init-db", Some(json!({ "host": "fake" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let credentials = json!({ "host": "fake", "port": 55553, "username": "msf", "password": "nope" });
        let (status, _) = send(&app, "POST", "/api/metasploit/init-db", Some(credentials)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let credentials = json!({ "host": "fake", "port": 55553, "username": "msf", "password": "good" });
        let (status, body) = send(&app, "POST", "/api/metasploit/init-db", Some(credentials)).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["status"]["connected"], true);

        let (_, status_body) = send(&app, "GET", "/api/metasploit/status", None).await;
        assert_eq!(status_body["connected"], true);
        assert_eq!(status_body["version"]["version"], "6.4.0");
    }

    #[tokio::test]
    async fn test_execute_command_and_module_shapes() {
        let framework = FakeFramework::new(|method, params| match method {
            "console.create" => Reply::Value(codec::map([("id", rmpv::Value::from("2"))])),
            "console.read" => Reply::Value(codec::map([
                ("data", rmpv::Value::from("Current sessions\n")),
                ("busy", rmpv::Value::from(false)),
            ])),
            "module.info" => Reply::Value(codec::map([
                ("error", rmpv::Value::from(true)),
                ("error_message", rmpv::Value::from("Invalid Module")),
            ])),
            _ => standard_reply(method, params),
        });
        let f = services(ScriptedRunner::new(), framework, Vec::new());
        let app = app(&f);

        let (status, body) = send(&app, "POST", "/api/metasploit/execute", Some(json!({ "command": "sessions -l" }))).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["data"]["output"], "Current sessions\n");
        assert_eq!(body["data"]["consoleId"], "2");

        let (status, _) = send(&app, "POST", "/api/metasploit/execute", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let module = json!({ "moduleType": "exploit", "moduleName": "unix/ftp/nothing", "options": { "RHOSTS": "10.0.0.7" } });
        let (status, body) = send(&app, "POST", "/api/metasploit/execute", Some(module)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_module_listing_rejects_unknown_type() {
        let f = services(ScriptedRunner::new(), FakeFramework::standard(), Vec::new());
        let app = app(&f);
        let (status, _) = send(&app, "GET", "/api/metasploit/modules?type=warez", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, "GET", "/api/metasploit/modules?type=post", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "post");
        assert_eq!(body["data"]["method"], "module.post");
    }

    #[tokio::test]
    async fn test_capture_errors() {
        let f = services(ScriptedRunner::new(), FakeFramework::standard(), Vec::new());
        let app = app(&f);

        let (status, _) = send(&app, "POST", "/api/capture/stop", Some(json!({ "sessionId": 5 }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, "POST", "/api/capture/start", Some(json!({ "filter": "port 80" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Failed to start packet capture");

        let (status, body) = send(&app, "GET", "/api/capture/active", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let f = services(ScriptedRunner::new(), FakeFramework::standard(), Vec::new());
        let (status, body) = send(&app(&f), "GET", "/api/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_object());
    }
}
