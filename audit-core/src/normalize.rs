//! Payload normalizer — flattens heterogeneous AI chat payloads into a
//! canonical message sequence.
//!
//! The gateway forwards several unrelated wire formats (OpenAI chat
//! completions, Anthropic messages, the Responses API, Gemini
//! generateContent). Capture must not depend on any of them being
//! well-formed: everything here is best-effort over loosely-typed JSON, and
//! a shape that does not match simply contributes no messages.

use serde_json::{Map, Value};

use crate::model::{CapturedMessage, MessageSource};

/// Request-side parse result: conversational messages plus an optional
/// system-level instruction reported separately by some protocols.
#[derive(Debug, Default)]
struct ParsedRequest {
    system: Option<Value>,
    messages: Vec<Value>,
}

/// Normalize one capture event into an ordered message sequence: system and
/// request messages first (parser order), then response messages.
///
/// Empty or whitespace-only content is dropped outright. The `index` counter
/// only advances for request-sourced messages that survive that filter;
/// response-sourced messages keep index 0.
pub fn build_chat_messages(
    platform: &str,
    request_body: &[u8],
    response_body: &[u8],
) -> Vec<CapturedMessage> {
    let req: Option<Map<String, Value>> = serde_json::from_slice::<Value>(request_body)
        .ok()
        .and_then(|v| match v {
            Value::Object(m) => Some(m),
            _ => None,
        });

    let mut msgs: Vec<CapturedMessage> = Vec::new();
    let mut index: i32 = 0;

    let mut push_request = |msgs: &mut Vec<CapturedMessage>, role: &str, content: String| {
        let content = content.trim().to_string();
        if content.is_empty() {
            return;
        }
        msgs.push(CapturedMessage {
            role: role.to_string(),
            content,
            source: MessageSource::Request,
            index,
        });
        index += 1;
    };

    if let Some(req) = &req {
        let mut protocol = platform.trim().to_lowercase();
        if protocol.is_empty() {
            protocol = "openai".to_string();
        }

        let parsed = parse_gateway_request(req, &protocol);
        if let Some(system) = &parsed.system {
            push_request(&mut msgs, "system", stringify_chat_content(system));
        }
        for msg in &parsed.messages {
            let (role, content) = normalize_message(msg);
            push_request(&mut msgs, &role, content);
        }

        if msgs.is_empty() {
            if let Some(input) = req.get("input") {
                push_request(&mut msgs, "user", stringify_chat_content(input));
            }
        }
    }

    for (role, content) in extract_response_messages(response_body) {
        msgs.push(CapturedMessage {
            role,
            content,
            source: MessageSource::Response,
            index: 0,
        });
    }

    msgs
}

/// Provider-aware request parsing, keyed by lower-cased protocol. Returns an
/// empty parse rather than an error when the expected shape is absent — the
/// caller's `input` fallback covers that case.
fn parse_gateway_request(req: &Map<String, Value>, protocol: &str) -> ParsedRequest {
    match protocol {
        "gemini" => parse_gemini_request(req),
        "claude" | "anthropic" => ParsedRequest {
            system: req.get("system").filter(|v| !v.is_null()).cloned(),
            messages: array_of(req, "messages"),
        },
        "codex" | "responses" => match req.get("input") {
            // A non-array `input` (a bare prompt string) is not a message
            // list; the whole parse stays empty so the top-level fallback in
            // build_chat_messages picks it up instead.
            Some(Value::Array(items)) => ParsedRequest {
                system: req
                    .get("instructions")
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| Value::String(s.to_string())),
                messages: items.clone(),
            },
            _ => ParsedRequest::default(),
        },
        // Default: canonical chat-completion shape. The system turn, if any,
        // already sits inside the messages array.
        _ => ParsedRequest {
            system: None,
            messages: array_of(req, "messages"),
        },
    }
}

fn parse_gemini_request(req: &Map<String, Value>) -> ParsedRequest {
    let system = req
        .get("system_instruction")
        .or_else(|| req.get("systemInstruction"))
        .map(|v| match v {
            Value::Object(obj) => obj.get("parts").cloned().unwrap_or_else(|| v.clone()),
            other => other.clone(),
        });

    let messages = req
        .get("contents")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    let role = item
                        .get("role")
                        .and_then(Value::as_str)
                        .unwrap_or("user");
                    let parts = item.get("parts").cloned().unwrap_or(Value::Null);
                    serde_json::json!({ "role": role, "content": parts })
                })
                .collect()
        })
        .unwrap_or_default();

    ParsedRequest { system, messages }
}

fn array_of(req: &Map<String, Value>, key: &str) -> Vec<Value> {
    req.get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Pull role/content out of a loosely-typed message value. Role defaults to
/// "user" when absent or empty.
fn normalize_message(msg: &Value) -> (String, String) {
    let mut role = String::new();
    let mut content = String::new();

    if let Value::Object(m) = msg {
        if let Some(r) = m.get("role").and_then(Value::as_str) {
            role = r.to_string();
        }
        if let Some(c) = m.get("content") {
            content = stringify_chat_content(c);
        }
    }
    if role.is_empty() {
        role = "user".to_string();
    }
    (role, content)
}

/// Flatten provider-specific rich content to plain text:
/// - strings pass through;
/// - lists are flattened recursively and joined with newlines;
/// - objects prefer a `text` field, then a nested `content` field, then
///   fall back to their JSON serialization;
/// - anything else serializes as JSON.
pub fn stringify_chat_content(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(stringify_chat_content).collect();
            parts.join("\n").trim().to_string()
        }
        Value::Object(obj) => {
            if let Some(text) = obj.get("text").and_then(Value::as_str) {
                return text.to_string();
            }
            if let Some(content) = obj.get("content") {
                return stringify_chat_content(content);
            }
            serde_json::to_string(v).unwrap_or_default()
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Best-effort extraction across the four known response shapes, tried in
/// priority order; the first shape that is present wins, even if it yields
/// nothing. Returned pairs are already trimmed and non-empty.
fn extract_response_messages(response_body: &[u8]) -> Vec<(String, String)> {
    let resp: Map<String, Value> = match serde_json::from_slice::<Value>(response_body) {
        Ok(Value::Object(m)) => m,
        _ => return Vec::new(),
    };

    let mut msgs: Vec<(String, String)> = Vec::new();
    let push = |msgs: &mut Vec<(String, String)>, role: &str, content: String| {
        let content = content.trim().to_string();
        if content.is_empty() {
            return;
        }
        msgs.push((role.to_string(), content));
    };

    // Shape 1: chat-completion `choices`
    if let Some(choices) = resp.get("choices").and_then(Value::as_array) {
        for c in choices {
            let Value::Object(m) = c else { continue };
            if let Some(Value::Object(msg)) = m.get("message") {
                let role = msg
                    .get("role")
                    .and_then(Value::as_str)
                    .filter(|r| !r.is_empty())
                    .unwrap_or("assistant");
                let content = msg.get("content").cloned().unwrap_or(Value::Null);
                push(&mut msgs, role, stringify_chat_content(&content));
            }
            if let Some(text) = m.get("text").and_then(Value::as_str) {
                push(&mut msgs, "assistant", text.to_string());
            }
        }
        return msgs;
    }

    // Shape 2: Responses-API `output`
    if let Some(output) = resp.get("output").and_then(Value::as_array) {
        for item in output {
            let Value::Object(m) = item else { continue };
            let role = m
                .get("role")
                .and_then(Value::as_str)
                .filter(|r| !r.is_empty())
                .unwrap_or("assistant");
            let content = m.get("content").cloned().unwrap_or(Value::Null);
            push(&mut msgs, role, stringify_chat_content(&content));
        }
        return msgs;
    }

    // Shape 3: bare top-level `content`
    if let Some(content) = resp.get("content") {
        push(&mut msgs, "assistant", stringify_chat_content(content));
        return msgs;
    }

    // Shape 4: Gemini `candidates`
    if let Some(candidates) = resp.get("candidates").and_then(Value::as_array) {
        for item in candidates {
            let Value::Object(m) = item else { continue };
            if let Some(Value::Object(c)) = m.get("content") {
                let parts = c.get("parts").cloned().unwrap_or(Value::Null);
                push(&mut msgs, "assistant", stringify_chat_content(&parts));
            }
        }
        return msgs;
    }

    Vec::new()
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
    // TEST 1: canonical request + chat-completion response (spec scenario)
    // ========================================================================
    #[test]
    fn test_openai_round() {
        let req = bytes(json!({"messages": [{"role": "user", "content": "hi"}]}));
        let resp = bytes(json!({"choices": [{"message": {"role": "assistant", "content": "hello"}}]}));

        let msgs = build_chat_messages("openai", &req, &resp);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[0].content, "hi");
        assert_eq!(msgs[0].source, MessageSource::Request);
        assert_eq!(msgs[0].index, 0);
        assert_eq!(msgs[1].role, "assistant");
        assert_eq!(msgs[1].content, "hello");
        assert_eq!(msgs[1].source, MessageSource::Response);
    }

    // ========================================================================
    // TEST 2: non-JSON request body yields only response-side messages
    // ========================================================================
    #[test]
    fn test_invalid_request_body_keeps_response_side() {
        let resp = bytes(json!({"choices": [{"message": {"content": "hello"}}]}));
        let msgs = build_chat_messages("openai", b"not json at all", &resp);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].source, MessageSource::Response);
        assert_eq!(msgs[0].role, "assistant");

        let msgs = build_chat_messages("openai", b"not json", b"also not json");
        assert!(msgs.is_empty());
    }

    // ========================================================================
    // TEST 3: a JSON array request body is not an object — ignored
    // ========================================================================
    #[test]
    fn test_non_object_request_body_ignored() {
        let req = bytes(json!([{"role": "user", "content": "hi"}]));
        let msgs = build_chat_messages("openai", &req, b"");
        assert!(msgs.is_empty());
    }

    // ========================================================================
    // TEST 4: empty and whitespace-only content never survives
    // ========================================================================
    #[test]
    fn test_empty_content_dropped() {
        let req = bytes(json!({"messages": [
            {"role": "user", "content": "   "},
            {"role": "user", "content": ""},
            {"role": "user", "content": "real"},
        ]}));
        let msgs = build_chat_messages("openai", &req, b"");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "real");
        // the index counter only advances for messages that survive
        assert_eq!(msgs[0].index, 0);
        assert!(msgs.iter().all(|m| !m.content.trim().is_empty()));
    }

    // ========================================================================
    // TEST 5: role defaults to "user" when absent
    // ========================================================================
    #[test]
    fn test_role_defaults_to_user() {
        let req = bytes(json!({"messages": [{"content": "no role here"}]}));
        let msgs = build_chat_messages("", &req, b"");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, "user");
    }

    // ========================================================================
    // TEST 6: content part lists flatten with newlines, recursively
    // ========================================================================
    #[test]
    fn test_content_part_list_flattening() {
        let req = bytes(json!({"messages": [{
            "role": "user",
            "content": [
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"},
            ],
        }]}));
        let msgs = build_chat_messages("openai", &req, b"");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "first\nsecond");
    }

    // ========================================================================
    // TEST 7: object content prefers text, then nested content, then JSON
    // ========================================================================
    #[test]
    fn test_stringify_object_preferences() {
        assert_eq!(
            stringify_chat_content(&json!({"text": "t", "content": "c"})),
            "t"
        );
        assert_eq!(stringify_chat_content(&json!({"content": "c"})), "c");
        assert_eq!(
            stringify_chat_content(&json!({"content": {"text": "nested"}})),
            "nested"
        );
        // no text/content: serialized as-is
        let got = stringify_chat_content(&json!({"tool_call": "x"}));
        assert_eq!(got, r#"{"tool_call":"x"}"#);
    }

    // ========================================================================
    // TEST 8: scalars serialize as JSON
    // ========================================================================
    #[test]
    fn test_stringify_scalars() {
        assert_eq!(stringify_chat_content(&json!("plain")), "plain");
        assert_eq!(stringify_chat_content(&json!(42)), "42");
        assert_eq!(stringify_chat_content(&json!(true)), "true");
    }

    // ========================================================================
    // TEST 9: zero parsed messages fall back to a top-level input field
    // ========================================================================
    #[test]
    fn test_input_fallback() {
        let req = bytes(json!({"input": "just a prompt"}));
        let msgs = build_chat_messages("openai", &req, b"");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[0].content, "just a prompt");
    }

    // ========================================================================
    // TEST 10: responses-API request — instructions become a system message
    // ========================================================================
    #[test]
    fn test_responses_api_request() {
        let req = bytes(json!({
            "instructions": "be terse",
            "input": [
                {"role": "user", "content": "question"},
            ],
        }));
        let msgs = build_chat_messages("codex", &req, b"");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "system");
        assert_eq!(msgs[0].content, "be terse");
        assert_eq!(msgs[0].index, 0);
        assert_eq!(msgs[1].role, "user");
        assert_eq!(msgs[1].content, "question");
        assert_eq!(msgs[1].index, 1);
    }

    // ========================================================================
    // TEST 10b: a bare string input bypasses the responses-API parse entirely
    // ========================================================================
    #[test]
    fn test_responses_string_input_falls_back() {
        let req = bytes(json!({
            "instructions": "be terse",
            "input": "just a prompt",
        }));
        let msgs = build_chat_messages("responses", &req, b"");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[0].content, "just a prompt");
    }

    // ========================================================================
    // TEST 11: anthropic request — top-level system ahead of messages
    // ========================================================================
    #[test]
    fn test_anthropic_request_system() {
        let req = bytes(json!({
            "system": "you are helpful",
            "messages": [{"role": "user", "content": "hey"}],
        }));
        let msgs = build_chat_messages("claude", &req, b"");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "system");
        assert_eq!(msgs[0].content, "you are helpful");
        assert_eq!(msgs[1].role, "user");
    }

    // ========================================================================
    // TEST 12: gemini request — contents/parts with systemInstruction
    // ========================================================================
    #[test]
    fn test_gemini_request() {
        let req = bytes(json!({
            "systemInstruction": {"parts": [{"text": "sys"}]},
            "contents": [
                {"role": "user", "parts": [{"text": "q1"}, {"text": "q2"}]},
            ],
        }));
        let msgs = build_chat_messages("Gemini", &req, b"");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "system");
        assert_eq!(msgs[0].content, "sys");
        assert_eq!(msgs[1].role, "user");
        assert_eq!(msgs[1].content, "q1\nq2");
    }

    // ========================================================================
    // TEST 13: response shape priority — choices wins over content
    // ========================================================================
    #[test]
    fn test_response_shape_priority() {
        let resp = bytes(json!({
            "choices": [{"message": {"content": "from choices"}}],
            "content": "from bare content",
        }));
        let msgs = build_chat_messages("openai", b"{}", &resp);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "from choices");
    }

    // ========================================================================
    // TEST 14: choices with a legacy text completion field
    // ========================================================================
    #[test]
    fn test_response_choices_text_field() {
        let resp = bytes(json!({"choices": [{"text": "completion text"}]}));
        let msgs = build_chat_messages("openai", b"{}", &resp);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, "assistant");
        assert_eq!(msgs[0].content, "completion text");
    }

    // ========================================================================
    // TEST 15: responses-API output array
    // ========================================================================
    #[test]
    fn test_response_output_array() {
        let resp = bytes(json!({"output": [
            {"role": "assistant", "content": [{"type": "output_text", "text": "out"}]},
        ]}));
        let msgs = build_chat_messages("codex", b"{}", &resp);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "out");
    }

    // ========================================================================
    // TEST 16: bare content and gemini candidates response shapes
    // ========================================================================
    #[test]
    fn test_response_bare_content_and_candidates() {
        let resp = bytes(json!({"content": [{"type": "text", "text": "anthropic style"}]}));
        let msgs = build_chat_messages("claude", b"{}", &resp);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "anthropic style");

        let resp = bytes(json!({"candidates": [
            {"content": {"parts": [{"text": "gemini says"}]}},
        ]}));
        let msgs = build_chat_messages("gemini", b"{}", &resp);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, "assistant");
        assert_eq!(msgs[0].content, "gemini says");
    }

    // ========================================================================
    // TEST 17: response messages are not indexed in the request counter
    //
    // Known asymmetry: request-sourced messages get 0..n, response-sourced
    // messages all carry index 0 regardless of how many request messages
    // preceded them. Deliberately preserved.
    // ========================================================================
    #[test]
    fn test_response_messages_keep_zero_index() {
        let req = bytes(json!({"messages": [
            {"role": "user", "content": "one"},
            {"role": "assistant", "content": "two"},
            {"role": "user", "content": "three"},
        ]}));
        let resp = bytes(json!({"choices": [{"message": {"content": "reply"}}]}));

        let msgs = build_chat_messages("openai", &req, &resp);
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].index, 0);
        assert_eq!(msgs[1].index, 1);
        assert_eq!(msgs[2].index, 2);
        assert_eq!(msgs[3].source, MessageSource::Response);
        assert_eq!(msgs[3].index, 0);
    }

    // ========================================================================
    // TEST 18: empty platform defaults to the chat-completion protocol
    // ========================================================================
    #[test]
    fn test_empty_platform_defaults_to_openai() {
        let req = bytes(json!({"messages": [{"role": "user", "content": "hi"}]}));
        let msgs = build_chat_messages("", &req, b"");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "hi");
    }
}
