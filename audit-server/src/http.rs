//! Admin HTTP API.
//!
//! Axum server exposing the capture intake and the audit admin surface.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to an
//! inner function returning `(StatusCode, serde_json::Value)`. The inner
//! functions are directly testable without axum dispatch machinery.
//!
//! Endpoints:
//! - GET    /health
//! - POST   /capture
//! - GET    /admin/security/sessions
//! - GET    /admin/security/messages
//! - GET    /admin/security/stats
//! - GET    /admin/security/sessions/export
//! - GET    /admin/security/logs/export
//! - DELETE /admin/security/sessions/:session_id
//! - POST   /admin/security/sessions/bulk-delete
//! - POST   /admin/security/logs/delete
//! - POST   /admin/security/summarize
//! - POST   /admin/security/ai-chat

use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::SecondsFormat;
use futures::stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use audit_core::model::{CaptureInput, ChatLog, ChatSession, MessageFilter, SessionFilter};
use audit_core::session::strip_session_suffix;
use audit_core::settings::SettingsSource;
use audit_core::AuditConfig;

use crate::subsystems::capture::{self, CaptureOutcome, SkipReason};
use crate::subsystems::query;
use crate::subsystems::relay::{AiRelay, RelayMessage, SummaryContext};

const SESSION_EXPORT_MAX_ROWS: i64 = 20_000;
const SESSION_EXPORT_PAGE_SIZE: i64 = 1_000;
const LOG_EXPORT_MAX_ROWS: i64 = 200_000;
const LOG_EXPORT_PAGE_SIZE: i64 = 500;
const SUMMARIZE_PAGE_SIZE: i64 = 500;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub pool: PgPool,
    pub config: AuditConfig,
    pub settings: Arc<dyn SettingsSource>,
    pub relay: Arc<AiRelay>,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/capture", post(capture_handler))
        .route("/admin/security/sessions", get(sessions_handler))
        .route("/admin/security/messages", get(messages_handler))
        .route("/admin/security/stats", get(stats_handler))
        .route("/admin/security/sessions/export", get(export_sessions_handler))
        .route("/admin/security/logs/export", get(export_logs_handler))
        .route(
            "/admin/security/sessions/:session_id",
            delete(delete_session_handler),
        )
        .route(
            "/admin/security/sessions/bulk-delete",
            post(bulk_delete_handler),
        )
        .route("/admin/security/logs/delete", post(delete_logs_handler))
        .route("/admin/security/summarize", post(summarize_handler))
        .route("/admin/security/ai-chat", post(ai_chat_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("audit HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

/// Capture intake payload. Bodies arrive as raw strings so the gateway can
/// forward whatever it observed, valid JSON or not.
#[derive(Debug, Deserialize, Default)]
pub struct CaptureRequest {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub client_request_id: String,
    pub user_id: Option<i64>,
    pub user_email: Option<String>,
    pub api_key_id: Option<i64>,
    pub account_id: Option<i64>,
    pub group_id: Option<i64>,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub request_path: String,
    #[serde(default)]
    pub stream: bool,
    pub status_code: Option<i32>,
    #[serde(default)]
    pub request_body: String,
    #[serde(default)]
    pub response_body: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct IdentityScope {
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct BulkDeleteRequest {
    #[serde(default)]
    pub session_ids: Vec<String>,
    #[serde(default)]
    pub select_all: bool,
    #[serde(flatten)]
    pub filter: SessionFilter,
}

#[derive(Debug, Deserialize, Default)]
pub struct AiChatRequest {
    pub context: Option<String>,
    #[serde(default)]
    pub messages: Vec<RelayMessage>,
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

fn error_body(msg: impl Into<String>) -> serde_json::Value {
    json!({ "error": msg.into(), "status": "error" })
}

/// Id parameters must be positive when supplied.
fn validate_ids(ids: &[(&str, Option<i64>)]) -> Result<(), String> {
    for (name, value) in ids {
        if let Some(v) = value {
            if *v <= 0 {
                return Err(format!("{name} must be a positive integer"));
            }
        }
    }
    Ok(())
}

fn session_filter_ids(f: &SessionFilter) -> [(&'static str, Option<i64>); 4] {
    [
        ("user_id", f.user_id),
        ("api_key_id", f.api_key_id),
        ("account_id", f.account_id),
        ("group_id", f.group_id),
    ]
}

fn message_filter_ids(f: &MessageFilter) -> [(&'static str, Option<i64>); 4] {
    [
        ("user_id", f.user_id),
        ("api_key_id", f.api_key_id),
        ("account_id", f.account_id),
        ("group_id", f.group_id),
    ]
}

pub async fn health_inner(pool: &PgPool) -> (StatusCode, serde_json::Value) {
    match audit_core::db::health_check(pool).await {
        Ok(version) => (
            StatusCode::OK,
            json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "postgresql": version,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "status": "unhealthy", "error": e.to_string() }),
        ),
    }
}

pub async fn capture_inner(
    pool: &PgPool,
    settings: &dyn SettingsSource,
    req: CaptureRequest,
) -> (StatusCode, serde_json::Value) {
    let input = CaptureInput {
        request_id: req.request_id,
        client_request_id: req.client_request_id,
        user_id: req.user_id,
        user_email: req.user_email,
        api_key_id: req.api_key_id,
        account_id: req.account_id,
        group_id: req.group_id,
        platform: req.platform,
        model: req.model,
        request_path: req.request_path,
        stream: req.stream,
        status_code: req.status_code,
        request_body: req.request_body.into_bytes(),
        response_body: req.response_body.into_bytes(),
    };

    match capture::record_chat(pool, settings, &input).await {
        Ok(CaptureOutcome::Recorded(log_id)) => {
            (StatusCode::OK, json!({ "status": "recorded", "log_id": log_id }))
        }
        Ok(CaptureOutcome::Skipped(reason)) => {
            let reason = match reason {
                SkipReason::EmptyBodies => "empty_bodies",
                SkipReason::ExcludedUser => "excluded_user",
                SkipReason::NoMessages => "no_messages",
                SkipReason::NoSessionKey => "no_session_key",
            };
            (StatusCode::OK, json!({ "status": "skipped", "reason": reason }))
        }
        Err(e) => {
            tracing::error!("capture failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))
        }
    }
}

pub async fn sessions_inner(
    pool: &PgPool,
    filter: SessionFilter,
) -> (StatusCode, serde_json::Value) {
    if let Err(msg) = validate_ids(&session_filter_ids(&filter)) {
        return (StatusCode::BAD_REQUEST, error_body(msg));
    }
    match query::list_sessions(pool, &filter).await {
        Ok(list) => (StatusCode::OK, json!(list)),
        Err(e) => {
            tracing::error!("session listing failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))
        }
    }
}

pub async fn messages_inner(
    pool: &PgPool,
    mut filter: MessageFilter,
) -> (StatusCode, serde_json::Value) {
    if let Err(msg) = validate_ids(&message_filter_ids(&filter)) {
        return (StatusCode::BAD_REQUEST, error_body(msg));
    }
    if filter.session_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, error_body("session_id is required"));
    }
    // a known session gets its full history
    filter.ignore_time_range = true;

    match query::list_messages(pool, &filter).await {
        Ok(list) => (StatusCode::OK, json!(list)),
        Err(e) => {
            tracing::error!("message listing failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))
        }
    }
}

pub async fn stats_inner(
    pool: &PgPool,
    filter: MessageFilter,
) -> (StatusCode, serde_json::Value) {
    if let Err(msg) = validate_ids(&message_filter_ids(&filter)) {
        return (StatusCode::BAD_REQUEST, error_body(msg));
    }
    let filter = MessageFilter {
        allow_empty_session: true,
        ..filter
    };
    let (_, _, start, end) = filter.normalize();

    let stats = match query::get_stats(pool, &filter).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("stats query failed: {e:#}");
            return (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()));
        }
    };

    let days = range_days(start, end);
    let platforms: Vec<serde_json::Value> = stats
        .platform_buckets
        .iter()
        .map(|b| {
            json!({
                "key": b.key,
                "count": b.count,
                "share": share(b.count, stats.request_count),
            })
        })
        .collect();

    (
        StatusCode::OK,
        json!({
            "request_count": stats.request_count,
            "session_count": stats.session_count,
            "estimated_bytes": stats.estimated_bytes,
            "table_bytes": stats.table_bytes,
            "days": days,
            "avg_requests_per_day": stats.request_count as f64 / days as f64,
            "avg_sessions_per_day": stats.session_count as f64 / days as f64,
            "platforms": platforms,
            "platform_share_basis": "request",
        }),
    )
}

/// Whole days spanned by the window, rounded up, at least 1.
fn range_days(start: chrono::DateTime<chrono::Utc>, end: chrono::DateTime<chrono::Utc>) -> i64 {
    let secs = (end - start).num_seconds().max(0);
    ((secs + 86_399) / 86_400).max(1)
}

fn share(count: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    count as f64 / total as f64
}

pub async fn delete_session_inner(
    pool: &PgPool,
    session_id: &str,
    scope: IdentityScope,
) -> (StatusCode, serde_json::Value) {
    if let Err(msg) = validate_ids(&[("user_id", scope.user_id), ("api_key_id", scope.api_key_id)])
    {
        return (StatusCode::BAD_REQUEST, error_body(msg));
    }
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return (StatusCode::BAD_REQUEST, error_body("session_id is required"));
    }

    match query::delete_session(pool, session_id, scope.user_id, scope.api_key_id).await {
        Ok((logs, sessions)) => (
            StatusCode::OK,
            json!({ "logs_deleted": logs, "sessions_deleted": sessions }),
        ),
        Err(e) => {
            tracing::error!("session delete failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))
        }
    }
}

pub async fn bulk_delete_inner(
    pool: &PgPool,
    req: BulkDeleteRequest,
) -> (StatusCode, serde_json::Value) {
    if let Err(msg) = validate_ids(&session_filter_ids(&req.filter)) {
        return (StatusCode::BAD_REQUEST, error_body(msg));
    }

    let result = if req.select_all {
        query::delete_sessions_by_filter(pool, &req.filter).await
    } else {
        let ids: Vec<String> = req
            .session_ids
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if ids.is_empty() {
            return (
                StatusCode::BAD_REQUEST,
                error_body("session_ids is required unless select_all is set"),
            );
        }
        query::delete_sessions(pool, &ids, req.filter.user_id, req.filter.api_key_id).await
    };

    match result {
        Ok((logs, sessions)) => (
            StatusCode::OK,
            json!({ "logs_deleted": logs, "sessions_deleted": sessions }),
        ),
        Err(e) => {
            tracing::error!("bulk delete failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))
        }
    }
}

pub async fn delete_logs_inner(
    pool: &PgPool,
    filter: MessageFilter,
) -> (StatusCode, serde_json::Value) {
    if let Err(msg) = validate_ids(&message_filter_ids(&filter)) {
        return (StatusCode::BAD_REQUEST, error_body(msg));
    }
    if filter.session_id.trim().is_empty() && !filter.allow_empty_session {
        return (
            StatusCode::BAD_REQUEST,
            error_body("session_id is required unless allow_empty_session is set"),
        );
    }

    match query::delete_logs_by_filter(pool, &filter).await {
        Ok((logs, sessions)) => (
            StatusCode::OK,
            json!({ "logs_deleted": logs, "sessions_deleted": sessions }),
        ),
        Err(e) => {
            tracing::error!("log delete failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))
        }
    }
}

// ============================================================================
// Summarize / AI chat
// ============================================================================

pub async fn summarize_inner(
    pool: &PgPool,
    relay: &AiRelay,
    filter: MessageFilter,
) -> (StatusCode, serde_json::Value) {
    if let Err(msg) = validate_ids(&message_filter_ids(&filter)) {
        return (StatusCode::BAD_REQUEST, error_body(msg));
    }

    let mut filter = MessageFilter {
        page: 1,
        page_size: SUMMARIZE_PAGE_SIZE,
        allow_empty_session: true,
        // an explicit session means "the whole conversation", not a window
        ignore_time_range: !filter.session_id.trim().is_empty(),
        ..filter
    };

    let mut list = match query::list_messages(pool, &filter).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("summarize query failed: {e:#}");
            return (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()));
        }
    };

    // A UI often hands us the display id without the caller-identity salt.
    if list.items.is_empty() {
        let stripped = strip_session_suffix(&filter.session_id);
        if !stripped.is_empty() && stripped != filter.session_id.trim() {
            filter.session_id = stripped;
            list = match query::list_messages(pool, &filter).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!("summarize re-query failed: {e:#}");
                    return (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()));
                }
            };
        }
    }

    if list.items.is_empty() {
        // an empty window is a finding, not a failure
        return (
            StatusCode::OK,
            json!({
                "summary": "No chat logs found for the selected range.",
                "sensitive_findings": [],
                "risk_level": "low",
                "recommended_actions": [],
                "log_count": 0,
            }),
        );
    }

    let context = summary_context(&filter, &list.items);
    match relay.summarize(&context, &list.items).await {
        Ok(result) => {
            let mut body = json!(result);
            if let Some(obj) = body.as_object_mut() {
                obj.insert("log_count".to_string(), json!(list.items.len()));
            }
            (StatusCode::OK, body)
        }
        Err(e) => (StatusCode::BAD_REQUEST, error_body(e.to_string())),
    }
}

fn summary_context(filter: &MessageFilter, logs: &[ChatLog]) -> SummaryContext {
    let sessions: std::collections::HashSet<&str> =
        logs.iter().map(|l| l.session_id.as_str()).collect();
    let message_count = logs.iter().map(|l| l.messages.len()).sum();
    let (start_time, end_time) = if filter.ignore_time_range {
        (None, None)
    } else {
        let (_, _, start, end) = filter.normalize();
        (Some(start), Some(end))
    };
    SummaryContext {
        session_count: sessions.len(),
        message_count,
        user_id: filter.user_id,
        api_key_id: filter.api_key_id,
        start_time,
        end_time,
    }
}

pub async fn ai_chat_inner(relay: &AiRelay, req: AiChatRequest) -> (StatusCode, serde_json::Value) {
    if req.messages.is_empty() {
        return (StatusCode::BAD_REQUEST, error_body("messages is required"));
    }
    match relay.chat(req.context.as_deref(), &req.messages).await {
        Ok(content) => (StatusCode::OK, json!({ "content": content })),
        Err(e) => (StatusCode::BAD_REQUEST, error_body(e.to_string())),
    }
}

// ============================================================================
// Exports
// ============================================================================

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn fmt_opt_i64(v: Option<i64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

const SESSION_EXPORT_HEADER: &str =
    "session_id,user_id,api_key_id,account_id,group_id,platform,model,first_at,last_at,request_count,message_preview\n";

fn render_session_rows(items: &[ChatSession]) -> String {
    let mut out = String::new();
    for s in items {
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{}\n",
            csv_field(&s.session_id),
            fmt_opt_i64(s.user_id),
            fmt_opt_i64(s.api_key_id),
            fmt_opt_i64(s.account_id),
            fmt_opt_i64(s.group_id),
            csv_field(s.platform.as_deref().unwrap_or("")),
            csv_field(s.model.as_deref().unwrap_or("")),
            s.first_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            s.last_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            s.request_count,
            csv_field(s.message_preview.as_deref().unwrap_or("")),
        ));
    }
    out
}

fn render_log_rows(items: &[ChatLog]) -> String {
    let mut out = String::new();
    for log in items {
        out.push_str("----\n");
        out.push_str(&format!("id: {}\n", log.id));
        out.push_str(&format!("session: {}\n", log.session_id));
        out.push_str(&format!(
            "time: {}\n",
            log.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        if let Some(platform) = &log.platform {
            out.push_str(&format!("platform: {platform}\n"));
        }
        if let Some(model) = &log.model {
            out.push_str(&format!("model: {model}\n"));
        }
        for msg in &log.messages {
            out.push_str(&format!(
                "[{}][{}][{}] {}\n",
                msg.index,
                msg.source.as_str(),
                msg.role,
                msg.content
            ));
        }
    }
    out
}

/// Stream matching sessions as CSV, one page of rows per body chunk,
/// stopping at the row cap. The returned flag says whether the cap will
/// truncate the result; it is decided up front from the match count so it
/// can travel in a header ahead of the body.
pub async fn export_sessions_inner(pool: PgPool, filter: SessionFilter) -> Result<(Body, bool)> {
    let total = query::list_sessions(
        &pool,
        &SessionFilter {
            page: 1,
            page_size: 1,
            ..filter.clone()
        },
    )
    .await?
    .total;
    let truncated = total > SESSION_EXPORT_MAX_ROWS;

    let header = stream::once(async { Ok::<String, anyhow::Error>(SESSION_EXPORT_HEADER.to_string()) });
    let pages = stream::try_unfold(
        (pool, filter, 1i64, 0i64),
        |(pool, filter, page, emitted)| async move {
            if emitted >= SESSION_EXPORT_MAX_ROWS {
                return Ok(None);
            }
            let list = query::list_sessions(
                &pool,
                &SessionFilter {
                    page,
                    page_size: SESSION_EXPORT_PAGE_SIZE,
                    ..filter.clone()
                },
            )
            .await?;
            if list.items.is_empty() {
                return Ok(None);
            }
            let take = (SESSION_EXPORT_MAX_ROWS - emitted).min(list.items.len() as i64);
            let chunk = render_session_rows(&list.items[..take as usize]);
            // a short page means the result set is exhausted
            let emitted = if (list.items.len() as i64) < SESSION_EXPORT_PAGE_SIZE {
                SESSION_EXPORT_MAX_ROWS
            } else {
                emitted + take
            };
            Ok(Some((chunk, (pool, filter, page + 1, emitted))))
        },
    );

    Ok((Body::from_stream(header.chain(pages)), truncated))
}

/// Stream matching log rows as plain text, one block per log.
pub async fn export_logs_inner(pool: PgPool, filter: MessageFilter) -> Result<(Body, bool)> {
    let filter = MessageFilter {
        allow_empty_session: true,
        ..filter
    };

    let total = query::list_messages(
        &pool,
        &MessageFilter {
            page: 1,
            page_size: 1,
            ..filter.clone()
        },
    )
    .await?
    .total;
    let truncated = total > LOG_EXPORT_MAX_ROWS;

    let pages = stream::try_unfold(
        (pool, filter, 1i64, 0i64),
        |(pool, filter, page, emitted)| async move {
            if emitted >= LOG_EXPORT_MAX_ROWS {
                return Ok::<_, anyhow::Error>(None);
            }
            let list = query::list_messages(
                &pool,
                &MessageFilter {
                    page,
                    page_size: LOG_EXPORT_PAGE_SIZE,
                    ..filter.clone()
                },
            )
            .await?;
            if list.items.is_empty() {
                return Ok(None);
            }
            let take = (LOG_EXPORT_MAX_ROWS - emitted).min(list.items.len() as i64);
            let chunk = render_log_rows(&list.items[..take as usize]);
            let emitted = if (list.items.len() as i64) < LOG_EXPORT_PAGE_SIZE {
                LOG_EXPORT_MAX_ROWS
            } else {
                emitted + take
            };
            Ok(Some((chunk, (pool, filter, page + 1, emitted))))
        },
    );

    Ok((Body::from_stream(pages), truncated))
}

fn export_response(
    body: Body,
    truncated: bool,
    content_type: &str,
    filename: &str,
) -> axum::response::Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = content_type.parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = format!("attachment; filename=\"{filename}\"").parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if truncated {
        if let Ok(value) = "true".parse() {
            headers.insert("X-Export-Truncated", value);
        }
    }
    (StatusCode::OK, headers, body).into_response()
}

// ============================================================================
// Axum handlers (thin wrappers)
// ============================================================================

async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.pool).await;
    (status, Json(body))
}

async fn capture_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<CaptureRequest>,
) -> impl IntoResponse {
    let (status, body) = capture_inner(&state.pool, state.settings.as_ref(), req).await;
    (status, Json(body))
}

async fn sessions_handler(
    State(state): State<Arc<HttpState>>,
    Query(filter): Query<SessionFilter>,
) -> impl IntoResponse {
    let (status, body) = sessions_inner(&state.pool, filter).await;
    (status, Json(body))
}

async fn messages_handler(
    State(state): State<Arc<HttpState>>,
    Query(filter): Query<MessageFilter>,
) -> impl IntoResponse {
    let (status, body) = messages_inner(&state.pool, filter).await;
    (status, Json(body))
}

async fn stats_handler(
    State(state): State<Arc<HttpState>>,
    Query(filter): Query<MessageFilter>,
) -> impl IntoResponse {
    let (status, body) = stats_inner(&state.pool, filter).await;
    (status, Json(body))
}

async fn export_sessions_handler(
    State(state): State<Arc<HttpState>>,
    Query(filter): Query<SessionFilter>,
) -> axum::response::Response {
    if let Err(msg) = validate_ids(&session_filter_ids(&filter)) {
        return (StatusCode::BAD_REQUEST, Json(error_body(msg))).into_response();
    }
    match export_sessions_inner(state.pool.clone(), filter).await {
        Ok((body, truncated)) => {
            export_response(body, truncated, "text/csv; charset=utf-8", "sessions.csv")
        }
        Err(e) => {
            tracing::error!("session export failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(error_body(e.to_string())),
            )
                .into_response()
        }
    }
}

async fn export_logs_handler(
    State(state): State<Arc<HttpState>>,
    Query(filter): Query<MessageFilter>,
) -> axum::response::Response {
    if let Err(msg) = validate_ids(&message_filter_ids(&filter)) {
        return (StatusCode::BAD_REQUEST, Json(error_body(msg))).into_response();
    }
    match export_logs_inner(state.pool.clone(), filter).await {
        Ok((body, truncated)) => {
            export_response(body, truncated, "text/plain; charset=utf-8", "logs.txt")
        }
        Err(e) => {
            tracing::error!("log export failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(error_body(e.to_string())),
            )
                .into_response()
        }
    }
}

async fn delete_session_handler(
    State(state): State<Arc<HttpState>>,
    Path(session_id): Path<String>,
    Query(scope): Query<IdentityScope>,
) -> impl IntoResponse {
    let (status, body) = delete_session_inner(&state.pool, &session_id, scope).await;
    (status, Json(body))
}

async fn bulk_delete_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<BulkDeleteRequest>,
) -> impl IntoResponse {
    let (status, body) = bulk_delete_inner(&state.pool, req).await;
    (status, Json(body))
}

async fn delete_logs_handler(
    State(state): State<Arc<HttpState>>,
    Json(filter): Json<MessageFilter>,
) -> impl IntoResponse {
    let (status, body) = delete_logs_inner(&state.pool, filter).await;
    (status, Json(body))
}

async fn summarize_handler(
    State(state): State<Arc<HttpState>>,
    Json(filter): Json<MessageFilter>,
) -> impl IntoResponse {
    let (status, body) = summarize_inner(&state.pool, &state.relay, filter).await;
    (status, Json(body))
}

async fn ai_chat_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<AiChatRequest>,
) -> impl IntoResponse {
    let (status, body) = ai_chat_inner(&state.relay, req).await;
    (status, Json(body))
}

// ============================================================================
// TESTS
// ============================================================================
