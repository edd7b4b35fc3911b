//! Remote Execution Gateway.
//!
//! Owns the conversation-to-thread mapping for a remote multi-agent execution
//! service, creates threads on first use, sends run requests, and folds the
//! resulting event stream into an accumulated result or hands back the raw
//! live stream.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use chat_gateway_error::GatewayError;

pub mod sse;

use sse::{SseBlockDecoder, SsePayload};

const JITTER_CAP_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct RemoteGatewayConfig {
    pub base_url: String,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub thread_ttl: Duration,
}

impl RemoteGatewayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1_000),
            thread_ttl: Duration::from_secs(3_600),
        }
    }
}

/// One conversation's binding to a remote thread.
#[derive(Debug, Clone)]
struct ThreadBinding {
    thread_id: String,
    user_id: String,
    agent_id: Option<String>,
    created_at: Instant,
    last_used: Instant,
}

/// A structured message as returned by the remote service, untyped beyond
/// what the gateway itself needs.
pub type ThreadMessage = Value;

/// The folded result of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOutcome {
    pub messages: Vec<ThreadMessage>,
    pub content: String,
    /// Set when the remote service was unreachable and the content is the
    /// locally synthesized apology.
    pub degraded: bool,
}

#[derive(Clone)]
pub struct RemoteGateway {
    inner: Arc<Inner>,
}

struct Inner {
    http_client: reqwest::Client,
    config: RemoteGatewayConfig,
    /// Serializes the create-on-miss path so two concurrent calls for the
    /// same conversation issue at most one thread creation.
    ensure_lock: Mutex<()>,
    threads: Mutex<HashMap<String, ThreadBinding>>,
}

impl RemoteGateway {
    pub fn new(config: RemoteGatewayConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                http_client: reqwest::Client::new(),
                config,
                ensure_lock: Mutex::new(()),
                threads: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RemoteGatewayConfig {
        &self.inner.config
    }

    /// Resolve the remote thread for a conversation, creating it on first
    /// use. Expired bindings are treated as absent.
    pub async fn ensure_thread(
        &self,
        conversation_id: &str,
        user_id: &str,
        agent_id: Option<&str>,
    ) -> Result<String, GatewayError> {
        if let Some(thread_id) = self.cached_thread(conversation_id).await {
            return Ok(thread_id);
        }

        let _guard = self.inner.ensure_lock.lock().await;
        // Re-check under the lock: a concurrent caller may have just created it.
        if let Some(thread_id) = self.cached_thread(conversation_id).await {
            return Ok(thread_id);
        }

        let thread_id = self.create_thread(agent_id).await?;
        debug!(conversation_id, thread_id, "created remote thread");

        let now = Instant::now();
        let mut threads = self.inner.threads.lock().await;
        threads.insert(
            conversation_id.to_string(),
            ThreadBinding {
                thread_id: thread_id.clone(),
                user_id: user_id.to_string(),
                agent_id: agent_id.map(str::to_string),
                created_at: now,
                last_used: now,
            },
        );
        Ok(thread_id)
    }

    /// Run one turn and fold the stream into the latest message list plus the
    /// most recent assistant content. Never fails: remote trouble degrades to
    /// a synthesized apology naming the unavailable agent.
    pub async fn invoke(
        &self,
        agent_id: &str,
        message: &str,
        user_id: &str,
        conversation_id: &str,
    ) -> InvokeOutcome {
        match self
            .try_invoke(agent_id, message, user_id, conversation_id)
            .await
        {
            Ok(outcome) => {
                self.sweep_expired(Instant::now()).await;
                outcome
            }
            Err(err) => {
                warn!(agent_id, conversation_id, error = %err, "invoke degraded to fallback message");
                fallback_outcome(agent_id)
            }
        }
    }

    async fn try_invoke(
        &self,
        agent_id: &str,
        message: &str,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<InvokeOutcome, GatewayError> {
        let thread_id = self
            .ensure_thread(conversation_id, user_id, Some(agent_id))
            .await?;

        let response = self
            .send_with_retry(|| {
                self.run_request(&thread_id, agent_id, message, user_id, conversation_id)
            })
            .await?;

        let mut accumulator = RunAccumulator::default();
        let mut decoder = SseBlockDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| GatewayError::StreamError {
                message: err.to_string(),
            })?;
            for payload in decoder.push(&chunk) {
                if payload == SsePayload::Done {
                    return Ok(accumulator.finish());
                }
                accumulator.absorb(payload);
            }
        }
        for payload in decoder.finish() {
            accumulator.absorb(payload);
        }
        Ok(accumulator.finish())
    }

    /// Open the raw decoded payload stream for a run, for callers that relay
    /// events live instead of waiting for the folded result.
    pub async fn open_stream(
        &self,
        agent_id: &str,
        message: &str,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<impl Stream<Item = SsePayload> + Send, GatewayError> {
        let thread_id = self
            .ensure_thread(conversation_id, user_id, Some(agent_id))
            .await?;
        let response = self
            .send_with_retry(|| {
                self.run_request(&thread_id, agent_id, message, user_id, conversation_id)
            })
            .await?;

        struct StreamState<S> {
            body: S,
            decoder: SseBlockDecoder,
            pending: VecDeque<SsePayload>,
            finished: bool,
        }

        let state = StreamState {
            body: response.bytes_stream(),
            decoder: SseBlockDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        };

        Ok(futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(payload) = state.pending.pop_front() {
                    return Some((payload, state));
                }
                if state.finished {
                    return None;
                }
                match state.body.next().await {
                    Some(Ok(chunk)) => {
                        state.pending.extend(state.decoder.push(&chunk));
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "run stream transport error");
                        state.pending.extend(state.decoder.finish());
                        state.finished = true;
                    }
                    None => {
                        state.pending.extend(state.decoder.finish());
                        state.finished = true;
                    }
                }
            }
        }))
    }

    async fn create_thread(&self, agent_id: Option<&str>) -> Result<String, GatewayError> {
        let url = format!("{}/threads", self.inner.config.base_url.trim_end_matches('/'));
        let body = match agent_id {
            Some(agent_id) => json!({ "metadata": { "assistant_id": agent_id } }),
            None => json!({}),
        };
        let response = self
            .send_with_retry(|| self.inner.http_client.post(&url).json(&body).send())
            .await?;

        let payload: Value =
            response
                .json()
                .await
                .map_err(|err| GatewayError::RemoteUnavailable {
                    agent: agent_id.unwrap_or("unknown").to_string(),
                    detail: Some(err.to_string()),
                })?;
        thread_id_from(&payload).ok_or_else(|| GatewayError::RemoteUnavailable {
            agent: agent_id.unwrap_or("unknown").to_string(),
            detail: Some("thread creation returned no identifier".to_string()),
        })
    }

    fn run_request(
        &self,
        thread_id: &str,
        agent_id: &str,
        message: &str,
        user_id: &str,
        conversation_id: &str,
    ) -> impl std::future::Future<Output = Result<reqwest::Response, reqwest::Error>> {
        let url = format!(
            "{}/threads/{}/runs/stream",
            self.inner.config.base_url.trim_end_matches('/'),
            thread_id
        );
        let body = json!({
            "input": {
                "messages": [{ "role": "user", "content": message }],
                "userId": user_id,
                "conversationId": conversation_id,
            },
            "assistant_id": agent_id,
            "config": {
                "configurable": {
                    "_credentials": { "user": { "sub": user_id } }
                }
            },
            "stream_mode": "values",
        });
        self.inner
            .http_client
            .post(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
    }

    /// Retry transient network failures with exponential backoff plus jitter:
    /// one initial attempt plus up to `max_retries` retries. Application-level
    /// HTTP errors are never retried.
    async fn send_with_retry<F, Fut>(&self, request: F) -> Result<reqwest::Response, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let max_retries = self.inner.config.max_retries;
        let mut attempt = 1u32;
        loop {
            match request().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(GatewayError::RemoteUnavailable {
                            agent: "unknown".to_string(),
                            detail: Some(format!("status {status}: {body}")),
                        });
                    }
                    return Ok(response);
                }
                Err(err) if is_transient(&err) && attempt <= max_retries => {
                    let delay = backoff_delay(self.inner.config.retry_base_delay, attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying transient failure");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(GatewayError::TransientNetwork {
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    async fn cached_thread(&self, conversation_id: &str) -> Option<String> {
        let ttl = self.inner.config.thread_ttl;
        let mut threads = self.inner.threads.lock().await;
        match threads.get_mut(conversation_id) {
            Some(binding) if binding.last_used.elapsed() < ttl => {
                binding.last_used = Instant::now();
                Some(binding.thread_id.clone())
            }
            Some(_) => {
                threads.remove(conversation_id);
                None
            }
            None => None,
        }
    }

    /// Evict bindings idle longer than the TTL. Called opportunistically
    /// after every successful invoke; no background timer.
    async fn sweep_expired(&self, now: Instant) {
        let ttl = self.inner.config.thread_ttl;
        let mut threads = self.inner.threads.lock().await;
        let before = threads.len();
        threads.retain(|_, binding| now.duration_since(binding.last_used) < ttl);
        let evicted = before - threads.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle thread bindings");
        }
    }

    #[cfg(test)]
    async fn backdate(&self, conversation_id: &str, age: Duration) {
        let mut threads = self.inner.threads.lock().await;
        if let Some(binding) = threads.get_mut(conversation_id) {
            binding.last_used = Instant::now() - age;
            binding.created_at = binding.last_used;
        }
    }

    #[cfg(test)]
    async fn binding_count(&self) -> usize {
        self.inner.threads.lock().await.len()
    }
}

/// The remote service has renamed this field across versions.
fn thread_id_from(payload: &Value) -> Option<String> {
    ["thread_id", "id", "threadId"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn is_transient(err: &reqwest::Error) -> bool {
    !err.is_status() && (err.is_connect() || err.is_timeout() || err.is_request() || err.is_body())
}

/// `base * 2^(attempt-1)` plus up to [`JITTER_CAP_MS`] of random jitter.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let scaled = base.saturating_mul(2u32.saturating_pow(exponent));
    let jitter = rand::thread_rng().gen_range(0..JITTER_CAP_MS);
    scaled + Duration::from_millis(jitter)
}

fn fallback_outcome(agent_id: &str) -> InvokeOutcome {
    let content = format!(
        "I'm sorry, the {agent_id} agent is unavailable right now. Please try again in a moment."
    );
    InvokeOutcome {
        messages: vec![json!({ "role": "assistant", "content": content })],
        content,
        degraded: true,
    }
}

/// Folds decoded payloads into the latest message list and the most recent
/// assistant content.
#[derive(Debug, Default)]
struct RunAccumulator {
    messages: Vec<ThreadMessage>,
    partial: Option<String>,
}

impl RunAccumulator {
    fn absorb(&mut self, payload: SsePayload) {
        match payload {
            SsePayload::Json(value) => {
                if let Some(messages) = value.get("messages").and_then(Value::as_array) {
                    // Full snapshot: later lists override earlier ones.
                    self.messages = messages.clone();
                } else if let Some(delta) = partial_value(&value) {
                    // The first non-empty partial seeds the content; empty
                    // partials never clear it.
                    if !delta.is_empty() {
                        self.partial = Some(delta);
                    }
                }
            }
            SsePayload::Text(text) => {
                if !text.trim().is_empty() {
                    self.partial = Some(text);
                }
            }
            SsePayload::Done => {}
        }
    }

    fn finish(self) -> InvokeOutcome {
        let content = latest_assistant_content(&self.messages)
            .or(self.partial)
            .unwrap_or_default();
        InvokeOutcome {
            messages: self.messages,
            content,
            degraded: false,
        }
    }
}

fn partial_value(value: &Value) -> Option<String> {
    ["delta", "partial", "content"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

/// Scan newest-to-oldest for the last assistant-authored non-empty content;
/// stream order breaks ties (later overrides earlier).
fn latest_assistant_content(messages: &[ThreadMessage]) -> Option<String> {
    messages.iter().rev().find_map(|message| {
        let role = message
            .get("role")
            .or_else(|| message.get("type"))
            .and_then(Value::as_str)?;
        if role != "assistant" && role != "ai" {
            return None;
        }
        let content = message_content(message)?;
        if content.is_empty() {
            None
        } else {
            Some(content)
        }
    })
}

fn message_content(message: &Value) -> Option<String> {
    match message.get("content") {
        Some(Value::String(text)) => Some(text.trim().to_string()),
        Some(Value::Array(parts)) => {
            let joined = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("");
            Some(joined.trim().to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_delays_fall_within_expected_windows() {
        let base = Duration::from_millis(1_000);
        for (attempt, floor) in [(1u32, 1_000u64), (2, 2_000), (3, 4_000)] {
            for _ in 0..50 {
                let delay = backoff_delay(base, attempt).as_millis() as u64;
                assert!(
                    (floor..floor + 100).contains(&delay),
                    "attempt {attempt}: delay {delay} outside [{floor}, {})",
                    floor + 100
                );
            }
        }
    }

    #[test]
    fn thread_id_accepts_all_known_field_names() {
        assert_eq!(
            thread_id_from(&json!({"thread_id": "t1"})),
            Some("t1".to_string())
        );
        assert_eq!(thread_id_from(&json!({"id": "t2"})), Some("t2".to_string()));
        assert_eq!(
            thread_id_from(&json!({"threadId": "t3"})),
            Some("t3".to_string())
        );
        assert_eq!(thread_id_from(&json!({"name": "t4"})), None);
    }

    #[test]
    fn latest_assistant_content_scans_newest_first() {
        let messages = vec![
            json!({"role": "assistant", "content": "first"}),
            json!({"role": "user", "content": "question"}),
            json!({"role": "ai", "content": "second"}),
            json!({"role": "assistant", "content": ""}),
        ];
        assert_eq!(
            latest_assistant_content(&messages),
            Some("second".to_string())
        );
    }

    #[test]
    fn structured_content_parts_are_joined() {
        let messages = vec![json!({
            "role": "assistant",
            "content": [{"type": "text", "text": "hello "}, {"type": "text", "text": "world"}]
        })];
        assert_eq!(
            latest_assistant_content(&messages),
            Some("hello world".to_string())
        );
    }

    #[test]
    fn accumulator_folds_snapshot_then_done() {
        let mut accumulator = RunAccumulator::default();
        accumulator.absorb(SsePayload::Json(
            json!({"messages": [{"role": "assistant", "content": "hi"}]}),
        ));
        let outcome = accumulator.finish();
        assert_eq!(outcome.content, "hi");
        assert!(!outcome.degraded);
    }

    #[test]
    fn empty_partials_never_clear_seeded_content() {
        let mut accumulator = RunAccumulator::default();
        accumulator.absorb(SsePayload::Json(json!({"delta": "partial answer"})));
        accumulator.absorb(SsePayload::Json(json!({"delta": ""})));
        let outcome = accumulator.finish();
        assert_eq!(outcome.content, "partial answer");
    }

    #[test]
    fn full_messages_win_over_partials() {
        let mut accumulator = RunAccumulator::default();
        accumulator.absorb(SsePayload::Json(json!({"delta": "partial"})));
        accumulator.absorb(SsePayload::Json(
            json!({"messages": [{"role": "assistant", "content": "final"}]}),
        ));
        assert_eq!(accumulator.finish().content, "final");
    }

    #[test]
    fn fallback_names_the_unavailable_agent() {
        let outcome = fallback_outcome("shopping-agent");
        assert!(outcome.degraded);
        assert!(outcome.content.contains("shopping-agent"));
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0]["role"], "assistant");
    }

    #[tokio::test]
    async fn expired_bindings_are_swept() {
        let mut config = RemoteGatewayConfig::new("http://127.0.0.1:1");
        config.thread_ttl = Duration::from_secs(60);
        let gateway = RemoteGateway::new(config);
        {
            let mut threads = gateway.inner.threads.lock().await;
            let now = Instant::now();
            threads.insert(
                "conv-1".to_string(),
                ThreadBinding {
                    thread_id: "t-1".to_string(),
                    user_id: "u-1".to_string(),
                    agent_id: None,
                    created_at: now,
                    last_used: now,
                },
            );
        }
        gateway.backdate("conv-1", Duration::from_secs(120)).await;
        gateway.sweep_expired(Instant::now()).await;
        assert_eq!(gateway.binding_count().await, 0);
    }

    #[tokio::test]
    async fn expired_binding_is_not_returned_from_cache() {
        let mut config = RemoteGatewayConfig::new("http://127.0.0.1:1");
        config.thread_ttl = Duration::from_secs(60);
        let gateway = RemoteGateway::new(config);
        {
            let mut threads = gateway.inner.threads.lock().await;
            let now = Instant::now();
            threads.insert(
                "conv-2".to_string(),
                ThreadBinding {
                    thread_id: "t-2".to_string(),
                    user_id: "u-2".to_string(),
                    agent_id: None,
                    created_at: now,
                    last_used: now,
                },
            );
        }
        assert_eq!(
            gateway.cached_thread("conv-2").await,
            Some("t-2".to_string())
        );
        gateway.backdate("conv-2", Duration::from_secs(120)).await;
        assert_eq!(gateway.cached_thread("conv-2").await, None);
    }
}
