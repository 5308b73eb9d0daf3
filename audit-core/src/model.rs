//! Domain types for the security chat audit module.
//!
//! Two persisted shapes: `ChatLog` (one capture event, one gateway call) and
//! `ChatSession` (denormalized aggregate per session key, merged on every
//! capture). `request_count` on a session is always derived from the log
//! table, never stored.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Which leg of the exchange produced a captured message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    Request,
    Response,
}

impl MessageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSource::Request => "request",
            MessageSource::Response => "response",
        }
    }
}

/// One normalized chat turn. `index` is only assigned to request-sourced
/// messages; response-sourced messages keep 0 (see normalize.rs tests).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedMessage {
    pub role: String,
    pub content: String,
    pub source: MessageSource,
    #[serde(default)]
    pub index: i32,
}

/// Everything the gateway hands us for one observed request/response pair.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureInput {
    pub request_id: String,
    pub client_request_id: String,
    pub user_id: Option<i64>,
    pub user_email: Option<String>,
    pub api_key_id: Option<i64>,
    pub account_id: Option<i64>,
    pub group_id: Option<i64>,
    pub platform: String,
    pub model: String,
    pub request_path: String,
    pub stream: bool,
    pub status_code: Option<i32>,
    #[serde(default)]
    pub request_body: Vec<u8>,
    #[serde(default)]
    pub response_body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatLog {
    pub id: i64,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_path: Option<String>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    pub messages: Vec<CapturedMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_preview: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSession {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_preview: Option<String>,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub request_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSessionList {
    pub items: Vec<ChatSession>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatLogList {
    pub items: Vec<ChatLog>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformBucket {
    pub key: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub request_count: i64,
    pub session_count: i64,
    pub estimated_bytes: i64,
    pub table_bytes: i64,
    pub platform_buckets: Vec<PlatformBucket>,
}

// ============================================================================
// Filters
// ============================================================================

const SESSION_DEFAULT_PAGE_SIZE: i64 = 50;
const SESSION_MAX_PAGE_SIZE: i64 = 100;
const MESSAGE_DEFAULT_PAGE_SIZE: i64 = 200;
const MESSAGE_MAX_PAGE_SIZE: i64 = 500;
// keeps (page - 1) * page_size comfortably inside i64 for any page size cap
const MAX_PAGE: i64 = 1_000_000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionFilter {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub session_id: String,
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub account_id: Option<i64>,
    pub group_id: Option<i64>,
    /// Substring search over session ids and previews ("q" on the wire).
    #[serde(default, alias = "q")]
    pub query: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub page: i64,
    #[serde(default)]
    pub page_size: i64,
}

impl SessionFilter {
    /// Clamp pagination and repair the time range. Never fails: an inverted
    /// range is swapped, absent bounds default to the last 24 hours.
    pub fn normalize(&self) -> (i64, i64, DateTime<Utc>, DateTime<Utc>) {
        normalize_window(
            self.page,
            self.page_size,
            SESSION_DEFAULT_PAGE_SIZE,
            SESSION_MAX_PAGE_SIZE,
            self.start_time,
            self.end_time,
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageFilter {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub session_id: String,
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub account_id: Option<i64>,
    pub group_id: Option<i64>,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub request_path: String,

    /// Skip the created_at window entirely — used when a caller already
    /// knows the session id and wants its full history.
    #[serde(default)]
    pub ignore_time_range: bool,
    /// Safety valve: without a session id, listing refuses to scan the
    /// whole log table unless this is set.
    #[serde(default)]
    pub allow_empty_session: bool,

    #[serde(default)]
    pub page: i64,
    #[serde(default)]
    pub page_size: i64,
}

impl MessageFilter {
    pub fn normalize(&self) -> (i64, i64, DateTime<Utc>, DateTime<Utc>) {
        normalize_window(
            self.page,
            self.page_size,
            MESSAGE_DEFAULT_PAGE_SIZE,
            MESSAGE_MAX_PAGE_SIZE,
            self.start_time,
            self.end_time,
        )
    }
}

fn normalize_window(
    page: i64,
    page_size: i64,
    default_size: i64,
    max_size: i64,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> (i64, i64, DateTime<Utc>, DateTime<Utc>) {
    let page = page.clamp(1, MAX_PAGE);
    let mut size = if page_size > 0 { page_size } else { default_size };
    if size > max_size {
        size = max_size;
    }

    let end_time = end.unwrap_or_else(Utc::now);
    let mut start_time = start.unwrap_or(end_time - Duration::hours(24));
    let mut end_time = end_time;
    if start_time > end_time {
        std::mem::swap(&mut start_time, &mut end_time);
    }

    (page, size, start_time, end_time)
}

/// Hard truncation by char count. Used for message previews (280) and the
/// relay transcript lines (800).
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

// ============================================================================
// TESTS
// ============================================================================
