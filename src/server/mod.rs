//! HTTP surface: the inbound event ingress and the admin contract.
//!
//! Ingress (`/filter`, `/filter/{event}`) accepts event envelopes from
//! upstream emitters and returns 200 once routing was accepted — filter
//! and delivery outcomes are observable through stats, not status codes.
//! The admin API under `/api` exposes the config entities, stats, recent
//! events, connection state, dispatcher test, and message history, behind
//! HTTP basic credentials and an optional IP allow-list.

use crate::adapter::ClientAdapter;
use crate::dispatch::WebhookDispatcher;
use crate::handlers::ConnectionHandler;
use crate::router::{detect_event_kind, EventKind, EventRouter};
use crate::settings::Settings;
use crate::store::config::{Contact, ContactUpdate, Group, GroupUpdate};
use crate::store::{
    ConfigStore, EventAction, MediaStore, MessageStore, StatField, StatsStore, StoredEvent,
};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

/// Inbound envelopes are small; cap the body to keep memory bounded.
const MAX_BODY_SIZE: usize = 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// A config snapshot is persisted every this many ingress events.
const CONFIG_AUTOSAVE_EVERY: u64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub router: Arc<EventRouter>,
    pub config: Arc<ConfigStore>,
    pub stats: Arc<StatsStore>,
    pub messages: Arc<MessageStore>,
    pub media: Arc<MediaStore>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub connection: Arc<ConnectionHandler>,
    pub adapter: Option<Arc<ClientAdapter>>,
    pub ingress_count: Arc<AtomicU64>,
}

// ── Error mapping ────────────────────────────────────────────

pub enum ApiError {
    Store(crate::store::StoreError),
    Unauthorized,
    Forbidden(&'static str),
    NotFound(&'static str),
    Unavailable(&'static str),
    Internal(String),
}

impl From<crate::store::StoreError> for ApiError {
    fn from(e: crate::store::StoreError) -> Self {
        Self::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use crate::store::StoreError;
        let (status, message) = match self {
            Self::Store(e) => {
                let status = match &e {
                    StoreError::Invalid { .. } => StatusCode::BAD_REQUEST,
                    StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                    StoreError::Duplicate { .. } => StatusCode::CONFLICT,
                    StoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            Self::Forbidden(reason) => (StatusCode::FORBIDDEN, reason.to_string()),
            Self::NotFound(what) => (StatusCode::NOT_FOUND, what.to_string()),
            Self::Unavailable(what) => (StatusCode::SERVICE_UNAVAILABLE, what.to_string()),
            Self::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ── Router assembly ──────────────────────────────────────────

pub fn app(state: AppState) -> Router {
    let admin = Router::new()
        .route("/contacts", get(list_contacts).post(add_contact))
        .route(
            "/contacts/{phone}",
            put(update_contact).delete(delete_contact),
        )
        .route("/groups", get(list_groups).post(add_group))
        .route("/groups/{id}", put(update_group).delete(delete_group))
        .route("/types", put(set_custom_types).get(get_custom_types))
        .route("/webhook", put(set_default_webhook))
        .route("/webhooks/types", put(set_type_webhooks))
        .route("/webhooks/health", get(webhook_health))
        .route("/webhooks/test", post(webhook_test))
        .route("/stats", get(stats_snapshot))
        .route("/events", get(recent_events))
        .route("/connection", get(connection_state))
        .route("/qr", get(qr_state))
        .route("/messages", get(message_sources))
        .route(
            "/messages/{source}",
            get(message_history).delete(delete_history),
        )
        .route("/media/{handle}", get(fetch_media))
        .route("/send", post(send_message))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin,
        ));

    Router::new()
        .route("/filter", post(ingress_shapeless))
        .route("/filter/{event}", post(ingress_named))
        .route("/health", get(health))
        .nest("/api", admin)
        .layer(middleware::from_fn_with_state(state.clone(), ip_guard))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

/// Bind and serve until the shutdown signal flips.
pub async fn serve(
    state: AppState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "server.listening");
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await?;
    Ok(())
}

// ── Middleware ───────────────────────────────────────────────

/// Client address for allow-list checks: forwarded headers first, then
/// the socket peer.
fn client_ip(headers: &HeaderMap, request: &axum::extract::Request) -> Option<IpAddr> {
    for header_name in ["X-Forwarded-For", "X-Real-IP"] {
        if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if let Ok(ip) = first.parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }
    request
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

/// Plain address or CIDR-prefix match against the allow-list.
fn ip_allowed(allowlist: &[String], ip: IpAddr) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    allowlist.iter().any(|entry| match entry.split_once('/') {
        Some((network, bits)) => match (network.parse::<Ipv4Addr>(), bits.parse::<u32>(), ip) {
            (Ok(network), Ok(bits), IpAddr::V4(ip)) if bits <= 32 => {
                let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
                (u32::from(ip) & mask) == (u32::from(network) & mask)
            }
            _ => false,
        },
        None => entry
            .parse::<IpAddr>()
            .map_or(false, |allowed| allowed == ip),
    })
}

async fn ip_guard(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.settings.ip_allowlist.is_empty() {
        return Ok(next.run(request).await);
    }
    let Some(ip) = client_ip(&headers, &request) else {
        return Err(ApiError::Forbidden("client address unavailable"));
    };
    if !ip_allowed(&state.settings.ip_allowlist, ip) {
        warn!(ip = %ip, "server.ip_rejected");
        return Err(ApiError::Forbidden("address not in allow-list"));
    }
    Ok(next.run(request).await)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn require_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (Some(user), Some(password)) = (
        state.settings.admin_user.as_deref(),
        state.settings.admin_password.as_deref(),
    ) else {
        // No credentials configured: admin surface is open (bind-local
        // deployments).
        return Ok(next.run(request).await);
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok());

    match provided {
        Some(credentials) => {
            let expected = format!("{user}:{password}");
            if constant_time_eq(&credentials, &expected) {
                Ok(next.run(request).await)
            } else {
                Err(ApiError::Unauthorized)
            }
        }
        None => Err(ApiError::Unauthorized),
    }
}

// ── Ingress ──────────────────────────────────────────────────

async fn ingress_shapeless(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(payload) = parse_ingress_body(&state, &body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid JSON body"})),
        )
            .into_response();
    };
    let kind = detect_event_kind(&payload)
        .unwrap_or(EventKind::MessagesUpsert)
        .as_str()
        .to_string();
    route_ingress(state, &kind, payload).await
}

async fn ingress_named(
    State(state): State<AppState>,
    Path(event): Path<String>,
    body: Bytes,
) -> Response {
    let Some(payload) = parse_ingress_body(&state, &body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid JSON body"})),
        )
            .into_response();
    };
    let kind = event.replace('-', "_").to_uppercase();
    route_ingress(state, &kind, payload).await
}

fn parse_ingress_body(state: &AppState, body: &Bytes) -> Option<Value> {
    match serde_json::from_slice::<Value>(body) {
        Ok(payload) => Some(payload),
        Err(e) => {
            state.stats.increment("INVALID_PAYLOAD", StatField::Total);
            let mut record = StoredEvent::new("INVALID_PAYLOAD", EventAction::Logged);
            record.error = Some(e.to_string());
            state.stats.log_event(record);
            None
        }
    }
}

async fn route_ingress(state: AppState, kind: &str, payload: Value) -> Response {
    let outcome = state.router.route(kind, &payload).await;

    let count = state.ingress_count.fetch_add(1, Ordering::SeqCst) + 1;
    if count % CONFIG_AUTOSAVE_EVERY == 0 {
        if let Err(e) = state.config.save() {
            warn!(error = %e, "server.config_autosave_failed");
        }
    }

    if outcome.success {
        (StatusCode::OK, Json(outcome)).into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(outcome)).into_response()
    }
}

// ── Health & state ───────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.stats.snapshot();
    Json(json!({
        "status": "ok",
        "instance": state.settings.instance_name,
        "connection": state.connection.state().status,
        "totalEvents": snapshot.total_events,
    }))
}

async fn connection_state(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.connection.state()).unwrap_or_default())
}

async fn qr_state(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    match state.connection.state().qr {
        Some(qr) => Ok(Json(serde_json::to_value(qr).unwrap_or_default())),
        None => Err(ApiError::NotFound("no pairing artifact available")),
    }
}

// ── Contacts & groups ────────────────────────────────────────

async fn list_contacts(State(state): State<AppState>) -> Json<Vec<Contact>> {
    Json(state.config.contacts())
}

async fn add_contact(
    State(state): State<AppState>,
    Json(contact): Json<Contact>,
) -> Result<(StatusCode, Json<Contact>), ApiError> {
    let created = state.config.add_contact(contact)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_contact(
    State(state): State<AppState>,
    Path(phone): Path<String>,
    Json(update): Json<ContactUpdate>,
) -> Result<Json<Contact>, ApiError> {
    Ok(Json(state.config.update_contact(&phone, update)?))
}

async fn delete_contact(
    State(state): State<AppState>,
    Path(phone): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.config.delete_contact(&phone)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_groups(State(state): State<AppState>) -> Json<Vec<Group>> {
    Json(state.config.groups())
}

async fn add_group(
    State(state): State<AppState>,
    Json(group): Json<Group>,
) -> Result<(StatusCode, Json<Group>), ApiError> {
    let created = state.config.add_group(group)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<GroupUpdate>,
) -> Result<Json<Group>, ApiError> {
    Ok(Json(state.config.update_group(&id, update)?))
}

async fn delete_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.config.delete_group(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CustomTypesBody {
    #[serde(rename = "contactTypes", default)]
    contact_types: Vec<String>,
    #[serde(rename = "groupTypes", default)]
    group_types: Vec<String>,
}

async fn set_custom_types(
    State(state): State<AppState>,
    Json(body): Json<CustomTypesBody>,
) -> Result<StatusCode, ApiError> {
    state
        .config
        .set_custom_types(body.contact_types, body.group_types)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_custom_types(State(state): State<AppState>) -> Json<Value> {
    let (contact_types, group_types) = state.config.custom_types();
    Json(json!({
        "contactTypes": contact_types,
        "groupTypes": group_types,
    }))
}

// ── Destinations ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WebhookBody {
    url: String,
}

async fn set_default_webhook(
    State(state): State<AppState>,
    Json(body): Json<WebhookBody>,
) -> Result<StatusCode, ApiError> {
    state.config.set_default_webhook(&body.url)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_type_webhooks(
    State(state): State<AppState>,
    Json(map): Json<HashMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    state.config.set_type_webhooks(map)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn webhook_health(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.dispatcher.health()).unwrap_or_default())
}

#[derive(Debug, Default, Deserialize)]
struct TestBody {
    #[serde(rename = "entityType")]
    entity_type: Option<String>,
}

async fn webhook_test(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    // Body is optional; an empty or shapeless body tests the default route.
    let entity_type = serde_json::from_slice::<TestBody>(&body)
        .ok()
        .and_then(|b| b.entity_type);
    let outcome = state.dispatcher.test(entity_type.as_deref()).await;
    Json(serde_json::to_value(outcome).unwrap_or_default())
}

// ── Stats & events ───────────────────────────────────────────

async fn stats_snapshot(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.stats.snapshot()).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
    offset: Option<usize>,
    event: Option<String>,
}

async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(50).min(500);
    let offset = query.offset.unwrap_or(0);
    let (events, total) = state.stats.recent(limit, query.event.as_deref(), offset);
    Json(json!({
        "events": events,
        "total": total,
        "limit": limit,
        "offset": offset,
    }))
}

// ── Message history & media ──────────────────────────────────

async fn message_sources(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sources": state.messages.sources_with_messages() }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn message_history(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(50).min(500);
    let offset = query.offset.unwrap_or(0);
    let (messages, has_more) = state.messages.get(&source, limit, offset);
    Json(json!({
        "messages": messages,
        "hasMore": has_more,
    }))
}

async fn delete_history(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Json<Value> {
    let deleted = state.messages.delete(&source);
    Json(json!({ "deleted": deleted }))
}

async fn fetch_media(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<Response, ApiError> {
    let info = state
        .media
        .get(&handle)
        .ok_or(ApiError::NotFound("media handle unknown"))?;
    let bytes = tokio::fs::read(&info.file_path)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, info.mime_type)],
        bytes,
    )
        .into_response())
}

// ── Outbound send (adapter mode) ─────────────────────────────

#[derive(Debug, Deserialize)]
struct SendBody {
    to: String,
    #[serde(default)]
    message: Option<String>,
    /// Base64-encoded media payload, sent as a media message when set.
    #[serde(rename = "mediaBase64", default)]
    media_base64: Option<String>,
    #[serde(rename = "mimeType", default)]
    mime_type: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<SendBody>,
) -> Result<Json<Value>, ApiError> {
    let adapter = state
        .adapter
        .as_ref()
        .ok_or(ApiError::Unavailable("client adapter not enabled"))?;

    let id = if let Some(media) = body.media_base64 {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(media.as_bytes())
            .map_err(|_| {
                ApiError::Store(crate::store::StoreError::invalid(
                    "mediaBase64",
                    "not valid base64",
                ))
            })?;
        let mime = body.mime_type.as_deref().unwrap_or("application/octet-stream");
        adapter
            .send_media(&body.to, bytes, mime, body.caption.as_deref())
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
    } else {
        let message = body.message.as_deref().unwrap_or_default();
        if message.is_empty() {
            return Err(ApiError::Store(crate::store::StoreError::invalid(
                "message",
                "empty message body",
            )));
        }
        adapter
            .send_text(&body.to, message)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
    };

    // Track the outgoing id so reply-mention detection recognizes it.
    state.messages.record_outgoing_id(&id);
    Ok(Json(json!({ "sent": true, "id": id })))
}
