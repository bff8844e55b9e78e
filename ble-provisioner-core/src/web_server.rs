use crate::config::SearchDefaults;
use crate::traits::{DiscoveredDevice, LogControl, SecurityKind, TransportKind};
use crate::{Error, Notification, Provisioner};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::error::Error as _;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

// 路由处理函数共享的状态
pub type WebServerState = State<Arc<AppState>>;

pub struct AppState {
    pub provisioner: Provisioner,
    pub logging: Arc<dyn LogControl>,
    pub search: SearchDefaults,
}

/// Starts the Axum web server on `bind_addr`.
///
/// # Returns
/// A `JoinHandle` for the server task.
pub fn start_web_server(
    provisioner: Provisioner,
    logging: Arc<dyn LogControl>,
    search: SearchDefaults,
    bind_addr: SocketAddr,
) -> JoinHandle<Result<(), Error>> {
    let app_state = Arc::new(AppState {
        provisioner,
        logging,
        search,
    });
    let app = build_router(app_state);

    tracing::info!("🌐 Web server listening on {}", bind_addr);

    tokio::spawn(async move {
        let listener = TcpListener::bind(bind_addr).await?;
        axum::serve(listener, app.into_make_service()).await?;
        Ok(())
    })
}

pub fn build_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/devices/search", post(api_search_devices))
        .route("/api/connect", post(api_connect))
        .route("/api/wifi/scan", post(api_scan_wifi))
        .route("/api/provision", post(api_provision))
        .route("/api/custom-data", post(api_custom_data))
        .route("/api/disconnect", post(api_disconnect))
        .route("/api/logging", post(api_logging))
        .route("/api/events", get(api_events))
        .with_state(app_state)
}

// --- Errors ---

/// Maps an error kind to the HTTP status the command surface reports.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        Error::ConnectInProgress(_) => StatusCode::CONFLICT,
        Error::BluetoothNotReady(_)
        | Error::ScanStreamFailed {
            permissions_issue: true,
            ..
        } => StatusCode::PRECONDITION_FAILED,
        Error::ConnectionTimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::ScanStartFailed
        | Error::ScanStreamFailed { .. }
        | Error::ConnectionFailed(_)
        | Error::SessionInitFailed { .. }
        | Error::WifiScanFailed { .. }
        | Error::ProvisioningFailed { .. }
        | Error::SendCustomDataFailed { .. } => StatusCode::BAD_GATEWAY,
        Error::UnsupportedTransport(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `{error:{code, message, cause?, reason?, permissionsIssue?}}`
pub fn error_body(err: &Error) -> Value {
    let mut body = json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    if let Some(cause) = err.source() {
        body["cause"] = json!(cause.to_string());
    }
    match err {
        Error::ProvisioningFailed { reason, .. } => body["reason"] = json!(reason),
        Error::ScanStreamFailed {
            permissions_issue, ..
        } => body["permissionsIssue"] = json!(permissions_issue),
        _ => {}
    }
    json!({ "error": body })
}

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (status_for(&self.0), Json(error_body(&self.0))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

// --- Request bodies ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    #[serde(default)]
    device_prefix: Option<String>,
    #[serde(default)]
    transport: Option<String>,
    #[serde(default)]
    security: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    device_name: String,
    #[serde(default)]
    proof_of_possession: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    device_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    device_name: String,
    ssid: String,
    #[serde(default)]
    pass_phrase: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomDataRequest {
    device_name: String,
    path: String,
    data_string: String,
}

#[derive(Deserialize)]
pub struct LoggingRequest {
    enabled: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceView<'a> {
    id: &'a str,
    name: &'a str,
    service_uuid: Option<&'a str>,
    rssi: i16,
}

impl<'a> From<&'a DiscoveredDevice> for DeviceView<'a> {
    fn from(d: &'a DiscoveredDevice) -> Self {
        Self {
            id: &d.name,
            name: &d.name,
            service_uuid: d.service_uuid.as_deref(),
            rssi: d.rssi,
        }
    }
}

// --- Route Handlers ---

async fn api_status(State(state): WebServerState) -> Json<Value> {
    let ble = state.provisioner.status();
    let session = state.provisioner.session_state().await;
    Json(json!({ "ble": ble, "session": session }))
}

async fn api_search_devices(
    State(state): WebServerState,
    Json(payload): Json<SearchRequest>,
) -> ApiResult {
    let defaults = &state.search;
    let prefix = payload
        .device_prefix
        .unwrap_or_else(|| defaults.device_prefix.clone());
    let transport = match payload.transport {
        Some(t) => TransportKind::from_str(&t)?,
        None => defaults.transport,
    };
    let security = match payload.security {
        Some(s) => SecurityKind::from_str(&s)?,
        None => defaults.security,
    };
    tracing::debug!(prefix = %prefix, "Handling /api/devices/search");

    let devices = state.provisioner.scan(&prefix, transport, security).await?;
    let views: Vec<DeviceView> = devices.iter().map(DeviceView::from).collect();
    Ok(Json(json!({ "devices": views })))
}

async fn api_connect(
    State(state): WebServerState,
    Json(payload): Json<ConnectRequest>,
) -> ApiResult {
    tracing::debug!(device = %payload.device_name, "Handling /api/connect");
    state
        .provisioner
        .connect(&payload.device_name, &payload.proof_of_possession)
        .await?;
    Ok(Json(json!({ "connected": true })))
}

async fn api_scan_wifi(
    State(state): WebServerState,
    Json(payload): Json<DeviceRequest>,
) -> ApiResult {
    let networks = state
        .provisioner
        .scan_wifi_networks(&payload.device_name)
        .await?;
    Ok(Json(json!({ "networks": networks })))
}

async fn api_provision(
    State(state): WebServerState,
    Json(payload): Json<ProvisionRequest>,
) -> ApiResult {
    tracing::debug!(device = %payload.device_name, ssid = %payload.ssid, "Handling /api/provision");
    state
        .provisioner
        .provision(&payload.device_name, &payload.ssid, &payload.pass_phrase)
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn api_custom_data(
    State(state): WebServerState,
    Json(payload): Json<CustomDataRequest>,
) -> ApiResult {
    let reply = state
        .provisioner
        .send_custom_data(&payload.device_name, &payload.path, &payload.data_string)
        .await?;
    Ok(Json(json!({ "success": true, "returnString": reply })))
}

async fn api_disconnect(
    State(state): WebServerState,
    Json(payload): Json<DeviceRequest>,
) -> Json<Value> {
    state.provisioner.disconnect(&payload.device_name).await;
    Json(json!({}))
}

async fn api_logging(
    State(state): WebServerState,
    Json(payload): Json<LoggingRequest>,
) -> ApiResult {
    state.logging.set_verbose(payload.enabled)?;
    Ok(Json(json!({ "enabled": state.logging.is_verbose() })))
}

fn sse_event(notification: &Notification) -> Result<Event, axum::Error> {
    match notification {
        Notification::UnexpectedlyDisconnected { device_name } => Event::default()
            .event("deviceDisconnected")
            .json_data(json!({ "deviceName": device_name })),
        Notification::ReadinessChanged { status } => {
            Event::default().event("statusUpdate").json_data(status)
        }
    }
}

/// 将编排器的带外通知转发为 SSE 事件流
async fn api_events(
    State(state): WebServerState,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.provisioner.subscribe();
    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(notification) => return Some((sse_event(&notification), rx)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "SSE subscriber lagged, notifications dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}
