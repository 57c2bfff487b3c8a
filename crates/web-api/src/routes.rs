use application::{Connection, DeliveryReport, RoomOccupancy};
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use domain::{RateLimitSubject, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::{
    auth::{AuthenticatedSubject, ClientAddress},
    error::{format_retry_after, retry_after_seconds, ApiError},
    state::AppState,
    ws_connection::ConnectionLifecycle,
};

#[derive(Debug, Deserialize)]
struct PostMessagePayload {
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct TextPayload {
    message: String,
}

#[derive(Debug, Serialize)]
struct DeliveryResponse {
    delivered: usize,
    dropped: usize,
}

impl From<DeliveryReport> for DeliveryResponse {
    fn from(report: DeliveryReport) -> Self {
        Self {
            delivered: report.delivered,
            dropped: report.dropped,
        }
    }
}

#[derive(Debug, Serialize)]
struct MembersResponse {
    room_id: RoomId,
    #[serde(flatten)]
    occupancy: RoomOccupancy,
}

#[derive(Debug, Serialize)]
struct RateLimitStatusResponse {
    scope: String,
    eligible_now: bool,
    retry_after_seconds: u64,
    retry_after: String,
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    subject: String,
    reset: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket_upgrade))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/rooms/{room_id}/messages", post(post_message))
        .route("/rooms/{room_id}/alerts", post(post_alert))
        .route("/rooms/{room_id}/members", get(room_members))
        .route("/rate-limits/{scope}", get(rate_limit_status))
        .route("/admin/rate-limits/{subject}", delete(reset_rate_limits))
        .route("/admin/notices", post(broadcast_notice))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

fn parse_room(room_id: String) -> Result<RoomId, ApiError> {
    RoomId::parse(room_id).map_err(ApiError::from)
}

async fn post_message(
    State(state): State<AppState>,
    AuthenticatedSubject(subject): AuthenticatedSubject,
    Path(room_id): Path<String>,
    Json(payload): Json<PostMessagePayload>,
) -> Result<(StatusCode, Json<DeliveryResponse>), ApiError> {
    let room_id = parse_room(room_id)?;
    let report = state
        .chat_service
        .post_message(&subject, room_id, payload.payload)?;

    Ok((StatusCode::ACCEPTED, Json(report.into())))
}

async fn post_alert(
    State(state): State<AppState>,
    AuthenticatedSubject(subject): AuthenticatedSubject,
    Path(room_id): Path<String>,
    Json(payload): Json<TextPayload>,
) -> Result<(StatusCode, Json<DeliveryResponse>), ApiError> {
    let room_id = parse_room(room_id)?;
    let report = state
        .chat_service
        .post_alert(&subject, room_id, payload.message)?;

    Ok((StatusCode::ACCEPTED, Json(report.into())))
}

async fn room_members(
    State(state): State<AppState>,
    AuthenticatedSubject(_subject): AuthenticatedSubject,
    Path(room_id): Path<String>,
) -> Result<Json<MembersResponse>, ApiError> {
    let room_id = parse_room(room_id)?;
    let occupancy = state.chat_service.room_occupancy(&room_id);

    Ok(Json(MembersResponse { room_id, occupancy }))
}

async fn rate_limit_status(
    State(state): State<AppState>,
    AuthenticatedSubject(subject): AuthenticatedSubject,
    ClientAddress(address): ClientAddress,
    Path(scope): Path<String>,
) -> Result<Json<RateLimitStatusResponse>, ApiError> {
    let status = state
        .chat_service
        .rate_limit_status(&subject, address, &scope)?;

    Ok(Json(RateLimitStatusResponse {
        scope,
        eligible_now: status.eligible_now,
        retry_after_seconds: retry_after_seconds(status.retry_after),
        retry_after: format_retry_after(status.retry_after),
    }))
}

async fn reset_rate_limits(
    State(state): State<AppState>,
    AuthenticatedSubject(actor): AuthenticatedSubject,
    Path(subject): Path<String>,
) -> Result<Json<ResetResponse>, ApiError> {
    // 先校验权限，避免向无权调用者暴露主体格式错误
    if !actor.role.can_reset_rate_limits() {
        return Err(ApiError::forbidden("reset capability required"));
    }
    let target: RateLimitSubject = subject.parse().map_err(ApiError::from)?;
    let reset = state.chat_service.reset_rate_limits(&actor, &target)?;

    Ok(Json(ResetResponse {
        subject: target.to_string(),
        reset,
    }))
}

async fn broadcast_notice(
    State(state): State<AppState>,
    AuthenticatedSubject(actor): AuthenticatedSubject,
    Json(payload): Json<TextPayload>,
) -> Result<(StatusCode, Json<DeliveryResponse>), ApiError> {
    let report = state
        .chat_service
        .broadcast_notice(&actor, payload.message)?;

    Ok((StatusCode::ACCEPTED, Json(report.into())))
}

/// 协议升级：认证、按地址限流、注册连接，然后交给连接生命周期
async fn websocket_upgrade(
    State(state): State<AppState>,
    AuthenticatedSubject(subject): AuthenticatedSubject,
    ClientAddress(address): ClientAddress,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    state.chat_service.admit_connection(address)?;

    let connection = Connection::from_config(subject.user_id, &state.hub_config);
    let connection_id = state
        .hub()
        .register(connection.clone())
        .map_err(application::ApplicationError::from)?;

    let failed_state = state.clone();
    Ok(ws
        .max_message_size(MAX_INBOUND_FRAME)
        .on_failed_upgrade(move |err| {
            tracing::warn!(connection_id = %connection_id, error = %err, "WebSocket 升级失败");
            failed_state.hub().unregister(connection_id);
        })
        .on_upgrade(move |socket| ConnectionLifecycle::new(state, connection).run(socket)))
}

/// 入站帧大小上限
const MAX_INBOUND_FRAME: usize = 64 * 1024;
