//! Model client - request/response wrapper over the chat API
//!
//! Adds three behaviors over the raw transport: retry with jittered
//! exponential backoff on transient failures, truncation detection on
//! replies, and automatic continuation requests that stitch a truncated
//! reply back together before the parser ever sees it.
//!
//! The transport itself is a trait so the mock used by `--mock` and the
//! test suite shares every code path above it.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::AgentError;
use crate::session::{Message, Role};

/// Retry schedule for transient failures: 500 ms, 1 s, 2 s (jittered ±20%).
const BACKOFF_MS: &[u64] = &[500, 1000, 2000];

/// Maximum continuation requests for one logical reply.
const MAX_CONTINUATIONS: usize = 2;

/// Provider hard caps that hint at truncation when a reply lands near one.
const PROVIDER_CAPS: &[usize] = &[4096, 8192, 16384];

/// Directive appended when asking the model to resume a cut-off reply.
const CONTINUE_DIRECTIVE: &str =
    "Your previous reply was cut off. Continue exactly from where you left off; \
     do not repeat anything already written.";

// ═══════════════════════════════════════════════════════════════
// WIRE TYPES
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// What `chat` hands back: the assembled text plus bookkeeping the loop
/// logs and the tests assert on.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub retries: u32,
    pub continuations: u32,
}

// ═══════════════════════════════════════════════════════════════
// TRANSPORT
// ═══════════════════════════════════════════════════════════════

/// One round-trip to the chat API: messages in, assistant text out.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, request: &ChatRequest) -> Result<String, AgentError>;
}

#[async_trait]
impl<T: ChatTransport + ?Sized> ChatTransport for std::sync::Arc<T> {
    async fn send(&self, request: &ChatRequest) -> Result<String, AgentError> {
        (**self).send(request).await
    }
}

/// Real HTTP transport.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(&self, request: &ChatRequest) -> Result<String, AgentError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .timeout(Duration::from_secs(120))
            .send()
            .await
            .map_err(|e| {
                // Connection-level failures are all retryable.
                AgentError::Transient(format!("request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::from_status(status.as_u16(), body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Transient(format!("bad response body: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| AgentError::Provider {
                status: status.as_u16(),
                message: "response contained no assistant text".into(),
            })
    }
}

/// Scripted transport for `--mock` runs and tests. Replies are consumed
/// front to back; an exhausted script is a provider error.
pub struct MockTransport {
    replies: Mutex<VecDeque<Result<String, AgentError>>>,
    /// Requests seen, for assertions.
    requests: Mutex<Vec<ChatRequest>>,
    /// Simulated latency per request.
    delay: Duration,
    inflight: std::sync::atomic::AtomicUsize,
    max_inflight: std::sync::atomic::AtomicUsize,
}

impl MockTransport {
    pub fn new(replies: Vec<Result<String, AgentError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            inflight: std::sync::atomic::AtomicUsize::new(0),
            max_inflight: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Convenience: a script of plain successful replies.
    pub fn with_replies(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    /// Add simulated latency to every request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    /// Highest number of requests that were in flight at once.
    pub fn max_concurrent_requests(&self) -> usize {
        self.max_inflight.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn send(&self, request: &ChatRequest) -> Result<String, AgentError> {
        use std::sync::atomic::Ordering;

        self.requests.lock().unwrap().push(request.clone());

        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inflight.fetch_sub(1, Ordering::SeqCst);

        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(AgentError::Provider {
                    status: 0,
                    message: "mock transport exhausted".into(),
                })
            })
    }
}

// ═══════════════════════════════════════════════════════════════
// CLIENT
// ═══════════════════════════════════════════════════════════════

/// Chat options for one client instance.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: crate::config::DEFAULT_MODEL.to_string(),
            temperature: Some(0.7),
            max_tokens: Some(4096),
        }
    }
}

pub struct ModelClient {
    transport: Box<dyn ChatTransport>,
    options: ChatOptions,
}

impl ModelClient {
    pub fn new(transport: Box<dyn ChatTransport>, options: ChatOptions) -> Self {
        Self { transport, options }
    }

    pub fn model(&self) -> &str {
        &self.options.model
    }

    /// One logical model turn: retries transient failures, detects
    /// truncation and stitches continuations, then returns the full text.
    /// `on_chunk` receives each received segment as it arrives, for
    /// progress display only.
    pub async fn chat(
        &self,
        cancel: &CancelToken,
        messages: &[Message],
        mut on_chunk: Option<&mut (dyn FnMut(&str) + Send)>,
    ) -> Result<ChatOutcome, AgentError> {
        let mut retries = 0u32;
        let mut continuations = 0u32;

        let mut text = self
            .send_with_retry(cancel, &to_wire(messages), &mut retries)
            .await?;
        if let Some(cb) = on_chunk.as_deref_mut() {
            cb(&text);
        }

        // Continuation: re-ask with the partial reply appended until the
        // result stops looking cut off or the budget runs out.
        while truncation_reason(&text).is_some() && continuations < MAX_CONTINUATIONS as u32 {
            continuations += 1;

            let mut follow_up: Vec<Message> = messages.to_vec();
            follow_up.push(Message::new(Role::Assistant, text.clone()));
            follow_up.push(Message::new(Role::User, CONTINUE_DIRECTIVE));

            let continuation = self
                .send_with_retry(cancel, &to_wire(&follow_up), &mut retries)
                .await?;
            if let Some(cb) = on_chunk.as_deref_mut() {
                cb(&continuation);
            }
            text.push_str(&continuation);
        }

        // Truncation is surfaced only when the continuation budget failed
        // to heal the reply.
        if let Some(reason) = truncation_reason(&text) {
            return Err(AgentError::Truncation(format!(
                "reply still incomplete after {} continuation(s): {}",
                continuations, reason
            )));
        }

        Ok(ChatOutcome {
            text,
            retries,
            continuations,
        })
    }

    async fn send_with_retry(
        &self,
        cancel: &CancelToken,
        wire: &[WireMessage],
        retries: &mut u32,
    ) -> Result<String, AgentError> {
        let request = ChatRequest {
            model: self.options.model.clone(),
            messages: wire.to_vec(),
            max_tokens: self.options.max_tokens,
            temperature: self.options.temperature,
        };

        let mut attempt = 0usize;
        loop {
            if cancel.is_canceled() {
                return Err(AgentError::Canceled);
            }

            let sent = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Canceled),
                r = self.transport.send(&request) => r,
            };

            match sent {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < BACKOFF_MS.len() => {
                    let delay = jittered(BACKOFF_MS[attempt]);
                    attempt += 1;
                    *retries += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AgentError::Canceled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn to_wire(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|m| WireMessage {
            // Chat-completions APIs have no tool role without call plumbing;
            // tool results ride as user turns, which every provider accepts.
            role: match m.role {
                Role::System => "system",
                Role::User | Role::Tool => "user",
                Role::Assistant => "assistant",
            },
            content: m.content.clone(),
        })
        .collect()
}

/// ±20% jitter without a rand dependency: derive from the clock's nanos.
fn jittered(base_ms: u64) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0) as u64;
    // factor in [0.8, 1.2)
    let factor = 0.8 + (nanos % 1000) as f64 / 2500.0;
    Duration::from_millis((base_ms as f64 * factor) as u64)
}

// ═══════════════════════════════════════════════════════════════
// TRUNCATION DETECTION
// ═══════════════════════════════════════════════════════════════

/// Why a reply looks cut off, or None if it looks complete.
pub fn truncation_reason(text: &str) -> Option<&'static str> {
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.ends_with('\\') {
        return Some("ends with line continuation");
    }
    // Bracket and string balance only mean truncation in JSON-bearing
    // replies; prose with a stray brace or quote is complete.
    let json_bearing = trimmed.contains("{\"") || trimmed.contains("{ \"");
    if json_bearing && inside_open_string(trimmed) {
        return Some("ends inside an open JSON string");
    }
    if json_bearing && has_unbalanced_brackets(trimmed) {
        return Some("unbalanced braces or brackets");
    }
    if near_provider_cap(text) && contains_partial_tool_token(trimmed) {
        return Some("length at provider cap with partial tool token");
    }
    None
}

/// Count braces/brackets outside string literals.
fn has_unbalanced_brackets(text: &str) -> bool {
    let mut brace = 0i64;
    let mut bracket = 0i64;
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => brace += 1,
            '}' => brace -= 1,
            '[' => bracket += 1,
            ']' => bracket -= 1,
            _ => {}
        }
    }
    brace > 0 || bracket > 0
}

/// Whether the text ends inside an unterminated JSON string literal.
fn inside_open_string(text: &str) -> bool {
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
        }
    }
    in_string
}

fn near_provider_cap(text: &str) -> bool {
    let len = text.len();
    PROVIDER_CAPS
        .iter()
        .any(|&cap| len <= cap && cap - len <= 10)
}

/// A `"tool` fragment near the end of the reply (possibly cut mid-token).
fn contains_partial_tool_token(text: &str) -> bool {
    const TOKEN: &str = "\"tool\"";
    let mut tail_start = text.len().saturating_sub(200);
    while !text.is_char_boundary(tail_start) {
        tail_start -= 1;
    }
    let tail = &text[tail_start..];
    if tail.contains("\"tool") {
        return true;
    }
    // The cut may fall inside the token itself.
    (2..TOKEN.len())
        .any(|n| text.ends_with(&TOKEN[..n]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn msgs() -> Vec<Message> {
        vec![
            Message::new(Role::System, "be helpful"),
            Message::new(Role::User, "hello"),
        ]
    }

    #[tokio::test]
    async fn test_retry_two_503s_then_success() {
        let transport = MockTransport::new(vec![
            Err(AgentError::from_status(503, "unavailable".into())),
            Err(AgentError::from_status(503, "unavailable".into())),
            Ok("recovered".into()),
        ]);
        let client = ModelClient::new(Box::new(transport), ChatOptions::default());

        let started = Instant::now();
        let outcome = client.chat(&CancelToken::new(), &msgs(), None).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome.text, "recovered");
        assert_eq!(outcome.retries, 2);
        // 500 ms + 1 s backoff, both jittered no lower than 80%
        assert!(elapsed >= Duration::from_millis(1200), "elapsed: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_non_transient_fails_immediately() {
        let transport = MockTransport::new(vec![
            Err(AgentError::from_status(401, "bad key".into())),
            Ok("never reached".into()),
        ]);
        let client = ModelClient::new(Box::new(transport), ChatOptions::default());

        let err = client.chat(&CancelToken::new(), &msgs(), None).await.unwrap_err();
        assert!(matches!(err, AgentError::Provider { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_retries_exhausted_surfaces_transient() {
        let transport = MockTransport::new(vec![
            Err(AgentError::Transient("a".into())),
            Err(AgentError::Transient("b".into())),
            Err(AgentError::Transient("c".into())),
            Err(AgentError::Transient("d".into())),
        ]);
        let client = ModelClient::new(Box::new(transport), ChatOptions::default());

        let err = client.chat(&CancelToken::new(), &msgs(), None).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_continuation_stitches_reply() {
        let part1 = r#"{"tool":"edit_file","args":{"path":"a.txt","old_text":"foo"#;
        let part2 = r#"","new_text":"bar"}}"#;
        let transport = MockTransport::new(vec![Ok(part1.into()), Ok(part2.into())]);
        let client = ModelClient::new(Box::new(transport), ChatOptions::default());

        let outcome = client.chat(&CancelToken::new(), &msgs(), None).await.unwrap();
        assert_eq!(outcome.continuations, 1);
        assert_eq!(outcome.text, format!("{}{}", part1, part2));
        // The stitched reply must now parse.
        let parsed: serde_json::Value = serde_json::from_str(&outcome.text).unwrap();
        assert_eq!(parsed["tool"], "edit_file");
    }

    #[tokio::test]
    async fn test_continuation_request_carries_directive() {
        let transport = MockTransport::new(vec![
            Ok("{\"tool\":\"exec\",\"args\":{\"command\":\"ls".into()),
            Ok("\"}}".into()),
        ]);
        let client = ModelClient::new(Box::new(transport), ChatOptions::default());
        let outcome = client.chat(&CancelToken::new(), &msgs(), None).await.unwrap();
        assert_eq!(outcome.continuations, 1);

        // We can't reach into the consumed transport, but the stitched text
        // proves the second request was issued and concatenated in order.
        assert!(outcome.text.ends_with("\"}}"));
    }

    #[tokio::test]
    async fn test_continuation_capped_at_two_then_error() {
        let transport = MockTransport::new(vec![
            Ok("{\"tool\": \"exec\", ".into()),
            Ok("\"args\": {".into()),
            Ok("\"command\": ".into()),
            Ok("never sent".into()),
        ]);
        let client = ModelClient::new(Box::new(transport), ChatOptions::default());
        let err = client.chat(&CancelToken::new(), &msgs(), None).await.unwrap_err();
        match err {
            AgentError::Truncation(msg) => assert!(msg.contains("2 continuation")),
            other => panic!("expected Truncation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_chat() {
        let transport = MockTransport::new(vec![Ok("unused".into())]);
        let client = ModelClient::new(Box::new(transport), ChatOptions::default());
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = client.chat(&cancel, &msgs(), None).await.unwrap_err();
        assert!(matches!(err, AgentError::Canceled));
    }

    #[tokio::test]
    async fn test_chunks_delivered_to_callback() {
        let transport = MockTransport::with_replies(&["plain full reply"]);
        let client = ModelClient::new(Box::new(transport), ChatOptions::default());
        let mut chunks: Vec<String> = Vec::new();
        let mut push = |s: &str| chunks.push(s.to_string());
        client
            .chat(&CancelToken::new(), &msgs(), Some(&mut push))
            .await
            .unwrap();
        assert_eq!(chunks, vec!["plain full reply".to_string()]);
    }

    #[test]
    fn test_truncation_unbalanced_braces() {
        assert!(truncation_reason(r#"{"tool": "exec", "args": {"#).is_some());
        assert!(truncation_reason(r#"{"tool": "exec", "args": {}}"#).is_none());
    }

    #[test]
    fn test_truncation_open_string() {
        assert!(truncation_reason(r#"{"tool": "exec", "args": {"command": "ls"#).is_some());
    }

    #[test]
    fn test_truncation_trailing_backslash() {
        assert!(truncation_reason("some text that ends with \\").is_some());
    }

    #[test]
    fn test_truncation_provider_cap_with_partial_token() {
        let mut text = "x".repeat(4088);
        text.push_str("{\"tool");
        // Balanced-bracket check fires first, but a reason is a reason.
        assert_eq!(text.len(), 4094);
        assert!(truncation_reason(&text).is_some());
    }

    #[test]
    fn test_plain_prose_not_truncated() {
        assert!(truncation_reason("The task is complete. All files written.").is_none());
    }

    #[test]
    fn test_wire_roles() {
        let wire = to_wire(&[
            Message::new(Role::System, "s"),
            Message::new(Role::Tool, "t"),
            Message::new(Role::Assistant, "a"),
        ]);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
        assert_eq!(wire[2].role, "assistant");
    }

    #[test]
    fn test_jitter_within_bounds() {
        for _ in 0..20 {
            let d = jittered(1000);
            assert!(d >= Duration::from_millis(800));
            assert!(d < Duration::from_millis(1200));
        }
    }

    #[tokio::test]
    async fn test_mock_transport_exhaustion() {
        let transport = MockTransport::with_replies(&[]);
        let client = ModelClient::new(Box::new(transport), ChatOptions::default());
        let err = client.chat(&CancelToken::new(), &msgs(), None).await.unwrap_err();
        assert!(matches!(err, AgentError::Provider { .. }));
    }
}
