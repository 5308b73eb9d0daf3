//! AI summarization relay.
//!
//! Forwards a window of captured messages to a chat-completion endpoint and
//! asks for a structured security summary. The relay is deliberately dumb:
//! it builds the prompt, posts it, and maps the reply back. Model choice and
//! endpoint come from `[ai]` config; the bearer key comes from
//! `AUDIT_AI_API_KEY` so it never lives in a file.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use audit_core::config::AiConfig;
use audit_core::model::{truncate_chars, ChatLog};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const TRANSCRIPT_LINE_MAX_CHARS: usize = 800;

const SUMMARY_SYSTEM_PROMPT: &str = "You are a security auditor. Summarize the activity, \
identify any sensitive data exposure, and output JSON with keys: summary, \
sensitive_findings (array), risk_level (low|medium|high), recommended_actions (array).";

const CHAT_SYSTEM_PROMPT: &str =
    "You are a security audit assistant. Provide concise, practical answers.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub role: String,
    pub content: String,
}

/// Structured summary shape the model is asked to produce. When the model
/// answers with plain prose instead, the whole reply lands in `summary`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryResult {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub sensitive_findings: Vec<String>,
    #[serde(default)]
    pub risk_level: String,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
}

/// Metadata header placed ahead of the transcript in the summarize prompt.
#[derive(Debug, Clone, Default)]
pub struct SummaryContext {
    pub session_count: usize,
    pub message_count: usize,
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

pub struct AiRelay {
    client: reqwest::Client,
    config: AiConfig,
    api_key: String,
}

impl AiRelay {
    pub fn new(config: AiConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    pub fn from_config(config: &AiConfig) -> Result<Self> {
        let api_key = std::env::var("AUDIT_AI_API_KEY").unwrap_or_default();
        Self::new(config.clone(), api_key)
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled && !self.config.api_base_url.trim().is_empty()
    }

    /// Summarize a window of captured logs.
    pub async fn summarize(
        &self,
        context: &SummaryContext,
        logs: &[ChatLog],
    ) -> Result<SummaryResult> {
        let messages = build_summary_prompt(context, logs);
        let content = self.complete(&messages).await?;

        // Prefer the structured shape; fall back to raw prose.
        match serde_json::from_str::<SummaryResult>(&content) {
            Ok(result) => Ok(result),
            Err(_) => Ok(SummaryResult {
                summary: content,
                ..Default::default()
            }),
        }
    }

    /// Free-form audit chat: the auditor persona, optional context as a
    /// second system message, then the caller's conversation.
    pub async fn chat(&self, context: Option<&str>, messages: &[RelayMessage]) -> Result<String> {
        let mut prompt = vec![RelayMessage {
            role: "system".to_string(),
            content: CHAT_SYSTEM_PROMPT.to_string(),
        }];
        if let Some(context) = context.map(str::trim).filter(|c| !c.is_empty()) {
            prompt.push(RelayMessage {
                role: "system".to_string(),
                content: format!("Context:\n{context}"),
            });
        }
        prompt.extend(messages.iter().cloned());
        self.complete(&prompt).await
    }

    async fn complete(&self, messages: &[RelayMessage]) -> Result<String> {
        if !self.enabled() {
            bail!("AI relay is not configured");
        }

        let endpoint = resolve_endpoint(&self.config.api_base_url);
        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": 0.2,
        });

        let mut request = self.client.post(&endpoint).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!(
                "upstream returned {status}: {}",
                truncate_chars(&detail, 200)
            );
        }

        let payload: Value = response.json().await?;
        log_token_usage(&payload);

        let content = extract_completion_content(&payload)
            .ok_or_else(|| anyhow!("upstream returned no completion content"))?;
        Ok(content)
    }
}

/// Base URL normalization: `.../v1` gets `/chat/completions`, anything else
/// gets the full `/v1/chat/completions` path.
pub fn resolve_endpoint(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

/// Metadata header plus one `[role/source] content` line per captured
/// message, newlines collapsed and each line capped at 800 chars.
pub fn build_summary_prompt(context: &SummaryContext, logs: &[ChatLog]) -> Vec<RelayMessage> {
    let mut lines = vec![
        format!("session_count: {}", context.session_count),
        format!("message_count: {}", context.message_count),
    ];
    if let Some(user_id) = context.user_id {
        lines.push(format!("user_id: {user_id}"));
    }
    if let Some(api_key_id) = context.api_key_id {
        lines.push(format!("api_key_id: {api_key_id}"));
    }
    if let (Some(start), Some(end)) = (context.start_time, context.end_time) {
        lines.push(format!(
            "range: {} - {}",
            start.to_rfc3339_opts(SecondsFormat::Secs, true),
            end.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }
    lines.push(String::new());

    for log in logs {
        for msg in &log.messages {
            let flat = msg.content.replace(['\n', '\r'], " ");
            lines.push(truncate_chars(
                &format!("[{}/{}] {}", msg.role, msg.source.as_str(), flat),
                TRANSCRIPT_LINE_MAX_CHARS,
            ));
        }
    }

    vec![
        RelayMessage {
            role: "system".to_string(),
            content: SUMMARY_SYSTEM_PROMPT.to_string(),
        },
        RelayMessage {
            role: "user".to_string(),
            content: lines.join("\n"),
        },
    ]
}

fn extract_completion_content(payload: &Value) -> Option<String> {
    let choice = payload.get("choices")?.as_array()?.first()?;
    let content = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .or_else(|| choice.get("text").and_then(Value::as_str))?;
    let content = content.trim();
    if content.is_empty() {
        return None;
    }
    Some(content.to_string())
}

/// Token usage is parsed for observability only; billing belongs to the
/// gateway.
fn log_token_usage(payload: &Value) {
    let Some(usage) = payload.get("usage") else {
        return;
    };
    let prompt = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    tracing::info!(prompt_tokens = prompt, completion_tokens = completion, "relay usage");
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use audit_core::model::{CapturedMessage, MessageSource};
    use chrono::TimeZone;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn relay_for(base_url: &str, key: &str) -> AiRelay {
        AiRelay::new(
            AiConfig {
                enabled: true,
                model: "audit-model".to_string(),
                api_base_url: base_url.to_string(),
            },
            key.to_string(),
        )
        .unwrap()
    }

    fn sample_log(contents: &[(&str, &str, MessageSource)]) -> ChatLog {
        let now = Utc::now();
        ChatLog {
            id: 1,
            session_id: "s:1:1".to_string(),
            request_id: None,
            client_request_id: None,
            user_id: Some(1),
            api_key_id: Some(1),
            account_id: None,
            group_id: None,
            platform: Some("opencode".to_string()),
            model: Some("gpt-4o".to_string()),
            request_path: None,
            stream: false,
            status_code: Some(200),
            messages: contents
                .iter()
                .enumerate()
                .map(|(i, (role, content, source))| CapturedMessage {
                    role: role.to_string(),
                    content: content.to_string(),
                    source: *source,
                    index: i as i32,
                })
                .collect(),
            message_preview: None,
            created_at: now,
            expires_at: now,
        }
    }

    // ========================================================================
    // TEST 1: endpoint normalization
    // ========================================================================
    #[test]
    fn test_resolve_endpoint() {
        assert_eq!(
            resolve_endpoint("https://api.example.com"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            resolve_endpoint("https://api.example.com/"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            resolve_endpoint("https://api.example.com/v1"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            resolve_endpoint("https://api.example.com/v1/"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    // ========================================================================
    // TEST 2: prompt header and transcript lines
    // ========================================================================
    #[test]
    fn test_build_summary_prompt() {
        let context = SummaryContext {
            session_count: 2,
            message_count: 3,
            user_id: Some(5),
            api_key_id: None,
            start_time: Some(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()),
            end_time: Some(Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()),
        };
        let log = sample_log(&[
            ("user", "line one\nline two", MessageSource::Request),
            ("assistant", "reply", MessageSource::Response),
        ]);

        let prompt = build_summary_prompt(&context, &[log]);
        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt[0].role, "system");
        assert!(prompt[0].content.contains("security auditor"));

        let user = &prompt[1].content;
        assert!(user.contains("session_count: 2"));
        assert!(user.contains("message_count: 3"));
        assert!(user.contains("user_id: 5"));
        assert!(!user.contains("api_key_id"));
        assert!(user.contains("range: 2026-03-01T00:00:00Z - 2026-03-02T00:00:00Z"));
        // newlines inside content collapse to spaces
        assert!(user.contains("[user/request] line one line two"));
        assert!(user.contains("[assistant/response] reply"));
    }

    // ========================================================================
    // TEST 3: transcript lines are capped at 800 chars
    // ========================================================================
    #[test]
    fn test_prompt_line_truncation() {
        let long = "x".repeat(2000);
        let log = sample_log(&[("user", &long, MessageSource::Request)]);
        let prompt = build_summary_prompt(&SummaryContext::default(), &[log]);
        let longest = prompt[1]
            .content
            .lines()
            .map(|l| l.chars().count())
            .max()
            .unwrap();
        assert_eq!(longest, 800);
    }

    // ========================================================================
    // TEST 4: structured JSON reply maps to SummaryResult
    // ========================================================================
    #[tokio::test]
    async fn test_summarize_structured_reply() {
        let server = MockServer::start().await;
        let reply = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content":
                "{\"summary\":\"ok\",\"sensitive_findings\":[\"token in log\"],\"risk_level\":\"medium\",\"recommended_actions\":[\"rotate\"]}"
            }}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5},
        });
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({"model": "audit-model", "temperature": 0.2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply))
            .mount(&server)
            .await;

        let relay = relay_for(&server.uri(), "test-key");
        let log = sample_log(&[("user", "hi", MessageSource::Request)]);
        let result = relay
            .summarize(&SummaryContext::default(), &[log])
            .await
            .unwrap();
        assert_eq!(result.summary, "ok");
        assert_eq!(result.risk_level, "medium");
        assert_eq!(result.sensitive_findings, vec!["token in log"]);
        assert_eq!(result.recommended_actions, vec!["rotate"]);
    }

    // ========================================================================
    // TEST 5: prose reply falls back to summary-only
    // ========================================================================
    #[tokio::test]
    async fn test_summarize_prose_fallback() {
        let server = MockServer::start().await;
        let reply = serde_json::json!({
            "choices": [{"message": {"content": "Nothing suspicious happened."}}],
        });
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply))
            .mount(&server)
            .await;

        let relay = relay_for(&server.uri(), "");
        let result = relay
            .summarize(&SummaryContext::default(), &[])
            .await
            .unwrap();
        assert_eq!(result.summary, "Nothing suspicious happened.");
        assert!(result.risk_level.is_empty());
        assert!(result.sensitive_findings.is_empty());
    }

    // ========================================================================
    // TEST 6: non-2xx and empty content are errors
    // ========================================================================
    #[tokio::test]
    async fn test_upstream_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;
        let relay = relay_for(&server.uri(), "");
        let err = relay
            .summarize(&SummaryContext::default(), &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("502"), "got: {err}");

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "   "}}],
            })))
            .mount(&server)
            .await;
        let relay = relay_for(&server.uri(), "");
        let err = relay
            .summarize(&SummaryContext::default(), &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no completion content"));
    }

    // ========================================================================
    // TEST 7: legacy text field is accepted
    // ========================================================================
    #[tokio::test]
    async fn test_legacy_text_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"text": "legacy answer"}],
            })))
            .mount(&server)
            .await;

        let relay = relay_for(&server.uri(), "");
        let answer = relay
            .chat(
                None,
                &[RelayMessage {
                    role: "user".to_string(),
                    content: "q".to_string(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(answer, "legacy answer");
    }

    // ========================================================================
    // TEST 8: chat injects the auditor persona and optional context
    // ========================================================================
    #[tokio::test]
    async fn test_chat_prompt_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "messages": [
                    {"role": "system", "content": CHAT_SYSTEM_PROMPT},
                    {"role": "system", "content": "Context:\nsession abc"},
                    {"role": "user", "content": "what happened?"},
                ],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "answer"}}],
            })))
            .mount(&server)
            .await;

        let relay = relay_for(&server.uri(), "");
        let answer = relay
            .chat(
                Some("session abc"),
                &[RelayMessage {
                    role: "user".to_string(),
                    content: "what happened?".to_string(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(answer, "answer");
    }

    // ========================================================================
    // TEST 9: disabled relay refuses before any network call
    // ========================================================================
    #[tokio::test]
    async fn test_disabled_relay() {
        let relay = AiRelay::new(AiConfig::default(), String::new()).unwrap();
        let err = relay
            .summarize(&SummaryContext::default(), &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }
}
