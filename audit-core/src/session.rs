//! Session key resolution.
//!
//! Session keys group capture events into conversations. Client-supplied
//! identifiers are trusted for continuity but salted with the caller's
//! user id and api key id so two tenants sending the same conversation id
//! can never share a session row.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

const SESSION_ID_KEYS: [&str; 3] = ["session_id", "conversation_id", "thread_id"];
const AUTO_WINDOW_SECS: i64 = 15 * 60;

/// Resolve the session key for one capture event.
///
/// Base identifier priority: `session_id` / `conversation_id` / `thread_id`
/// top-level string fields, then `metadata.session_id`, then the gateway's
/// client request id, then its request id. A found base is salted as
/// `{base}:{user_id}:{api_key_id}` with 0 for absent ids.
///
/// With no base at all, events fall into synthetic 15-minute buckets:
/// `auto:{user_id}:{api_key_id}:{window}`. Returns an empty string only when
/// there is also no timestamp to bucket by.
pub fn resolve_session_key(
    request_body: &[u8],
    client_request_id: &str,
    request_id: &str,
    user_id: Option<i64>,
    api_key_id: Option<i64>,
    created_at: Option<DateTime<Utc>>,
) -> String {
    let uid = user_id.unwrap_or(0);
    let akid = api_key_id.unwrap_or(0);

    if let Some(base) = extract_base_id(request_body, client_request_id, request_id) {
        return format!("{base}:{uid}:{akid}");
    }

    if let Some(ts) = created_at {
        let secs = ts.timestamp();
        let window = secs - secs.rem_euclid(AUTO_WINDOW_SECS);
        if let Some(start) = Utc.timestamp_opt(window, 0).single() {
            return format!("auto:{uid}:{akid}:{}", start.format("%Y%m%d%H%M%S"));
        }
    }

    String::new()
}

fn extract_base_id(
    request_body: &[u8],
    client_request_id: &str,
    request_id: &str,
) -> Option<String> {
    let req: Option<Map<String, Value>> = serde_json::from_slice::<Value>(request_body)
        .ok()
        .and_then(|v| match v {
            Value::Object(m) => Some(m),
            _ => None,
        });

    if let Some(req) = &req {
        for key in SESSION_ID_KEYS {
            if let Some(id) = non_empty_str(req.get(key)) {
                return Some(id);
            }
        }
        if let Some(Value::Object(meta)) = req.get("metadata") {
            if let Some(id) = non_empty_str(meta.get("session_id")) {
                return Some(id);
            }
        }
    }

    let client_request_id = client_request_id.trim();
    if !client_request_id.is_empty() {
        return Some(client_request_id.to_string());
    }
    let request_id = request_id.trim();
    if !request_id.is_empty() {
        return Some(request_id.to_string());
    }
    None
}

fn non_empty_str(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Undo the per-caller salt when the two trailing `:`-separated segments are
/// both integers. Keys without the salt shape come back unchanged, so this
/// is safe to apply to arbitrary user input.
pub fn strip_session_suffix(session_id: &str) -> String {
    let value = session_id.trim();
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() < 3 {
        return value.to_string();
    }
    let numeric = parts[parts.len() - 2..]
        .iter()
        .all(|p| p.parse::<i64>().is_ok());
    if !numeric {
        return value.to_string();
    }
    parts[..parts.len() - 2].join(":")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bytes(v: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&v).unwrap()
    }

    // ========================================================================
    // TEST 1: explicit session id wins and gets salted
    // ========================================================================
    #[test]
    fn test_session_id_salted() {
        let body = bytes(json!({"session_id": "abc"}));
        let key = resolve_session_key(&body, "cr-1", "r-1", Some(5), Some(9), None);
        assert_eq!(key, "abc:5:9");
    }

    // ========================================================================
    // TEST 2: identifier priority chain
    // ========================================================================
    #[test]
    fn test_identifier_priority() {
        let body = bytes(json!({
            "conversation_id": "conv",
            "thread_id": "thread",
            "metadata": {"session_id": "meta"},
        }));
        let key = resolve_session_key(&body, "cr", "r", None, None, None);
        assert_eq!(key, "conv:0:0");

        let body = bytes(json!({"thread_id": "thread", "metadata": {"session_id": "meta"}}));
        let key = resolve_session_key(&body, "cr", "r", None, None, None);
        assert_eq!(key, "thread:0:0");

        let body = bytes(json!({"metadata": {"session_id": "meta"}}));
        let key = resolve_session_key(&body, "cr", "r", None, None, None);
        assert_eq!(key, "meta:0:0");

        let key = resolve_session_key(b"{}", "cr", "r", None, None, None);
        assert_eq!(key, "cr:0:0");

        let key = resolve_session_key(b"{}", "  ", "r", None, None, None);
        assert_eq!(key, "r:0:0");
    }

    // ========================================================================
    // TEST 3: non-string and whitespace identifiers are skipped
    // ========================================================================
    #[test]
    fn test_non_string_identifiers_skipped() {
        let body = bytes(json!({"session_id": 42, "conversation_id": "   ", "thread_id": "t"}));
        let key = resolve_session_key(&body, "", "", None, None, None);
        assert_eq!(key, "t:0:0");
    }

    // ========================================================================
    // TEST 4: absent ids salt as zero
    // ========================================================================
    #[test]
    fn test_missing_ids_salt_as_zero() {
        let body = bytes(json!({"session_id": "abc"}));
        let key = resolve_session_key(&body, "", "", None, Some(7), None);
        assert_eq!(key, "abc:0:7");
    }

    // ========================================================================
    // TEST 5: no base id falls back to a 15-minute auto bucket
    // ========================================================================
    #[test]
    fn test_auto_window_fallback() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 10, 17, 42).unwrap();
        let key = resolve_session_key(b"{}", "", "", Some(5), Some(9), Some(ts));
        assert_eq!(key, "auto:5:9:20260301101500");

        // two events in the same window share a key
        let ts2 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 29, 59).unwrap();
        let key2 = resolve_session_key(b"{}", "", "", Some(5), Some(9), Some(ts2));
        assert_eq!(key, key2);

        // the next window gets a new key
        let ts3 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 30, 0).unwrap();
        let key3 = resolve_session_key(b"{}", "", "", Some(5), Some(9), Some(ts3));
        assert_eq!(key3, "auto:5:9:20260301103000");
    }

    // ========================================================================
    // TEST 6: no base and no timestamp yields an empty key
    // ========================================================================
    #[test]
    fn test_no_base_no_timestamp() {
        let key = resolve_session_key(b"not json", "", "", None, None, None);
        assert_eq!(key, "");
    }

    // ========================================================================
    // TEST 7: strip_session_suffix removes exactly one numeric salt pair
    // ========================================================================
    #[test]
    fn test_strip_session_suffix() {
        assert_eq!(strip_session_suffix("abc:5:9"), "abc");
        assert_eq!(strip_session_suffix("a:b:5:9"), "a:b");
        assert_eq!(strip_session_suffix("auto:5:9:20260301101500"), "auto:5");
        // fewer than three segments: unchanged
        assert_eq!(strip_session_suffix("abc:5"), "abc:5");
        assert_eq!(strip_session_suffix("abc"), "abc");
        // non-numeric trailing segments: unchanged
        assert_eq!(strip_session_suffix("abc:5:x"), "abc:5:x");
        assert_eq!(strip_session_suffix("abc:x:9"), "abc:x:9");
        // whitespace trimmed first
        assert_eq!(strip_session_suffix("  abc:5:9  "), "abc");
    }
}
