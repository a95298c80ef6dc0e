//! HTTP surface of the gateway

use crate::auth::bearer_token;
use crate::command::ControlCommand;
use crate::error::DispatchError;
use crate::gateway::{device, monitor, Gateway};
use crate::session::SessionSnapshot;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use securex_shared::access::{check_access, AccessDecision, DenialReason, UserRecord};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Access level needed to read the device list
const LIST_ACCESS_LEVEL: u8 = 1;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:device_id/control", post(control))
        .route("/ws/device", get(device::device_ws))
        .route("/ws/monitor", get(monitor::monitor_ws))
        .with_state(gateway)
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Missing or unknown bearer token")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(DenialReason),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Dispatch(DispatchError::DeviceNotConnected(_)) => StatusCode::CONFLICT,
            ApiError::Dispatch(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub register: u16,
    pub value: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlAccepted {
    device_id: String,
    register: u16,
    value: u16,
    status: &'static str,
}

async fn health(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(gateway.health())
}

async fn list_devices(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionSnapshot>>, ApiError> {
    authorize(&gateway, &headers, "devices", LIST_ACCESS_LEVEL)?;
    Ok(Json(gateway.registry().list()))
}

async fn control(
    State(gateway): State<Arc<Gateway>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ControlRequest>,
) -> Result<(StatusCode, Json<ControlAccepted>), ApiError> {
    let user = authorize(&gateway, &headers, &device_id, gateway.control_access_level())?;

    let command = ControlCommand::new(device_id, request.register, request.value);
    gateway.dispatcher().dispatch_command(&command).await?;
    info!(
        user_id = %user.user_id,
        device_id = %command.device_id,
        register = command.register,
        value = command.value,
        "Control dispatched"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(ControlAccepted {
            device_id: command.device_id,
            register: command.register,
            value: command.value,
            status: "dispatched",
        }),
    ))
}

fn authorize(
    gateway: &Gateway,
    headers: &HeaderMap,
    resource: &str,
    required_level: u8,
) -> Result<UserRecord, ApiError> {
    let user = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .and_then(|token| gateway.validator().validate(token))
        .ok_or(ApiError::Unauthorized)?;

    match check_access(Some(&user), resource, required_level) {
        AccessDecision::Granted => Ok(user),
        AccessDecision::Denied(reason) => Err(ApiError::Forbidden(reason)),
    }
}
