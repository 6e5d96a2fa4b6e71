//! Chat completion clients.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::config::ModelConfig;
use crate::error::{PersonaError, Result};
use crate::message::Message;
use crate::stream::{collect_fragments, SseDecoder, SseEvent, StreamAssembler};

const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// Produces the assistant reply for a context window.
///
/// Batch and streaming are separate code paths with the same post-condition:
/// one assembled reply string, or an error. Neither path retries.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete_batch(&self, window: &[Message]) -> Result<String>;

    async fn complete_stream(&self, window: &[Message]) -> Result<String>;

    async fn complete(&self, window: &[Message], streaming: bool) -> Result<String> {
        if streaming {
            self.complete_stream(window).await
        } else {
            self.complete_batch(window).await
        }
    }
}

#[async_trait]
impl<C: CompletionClient + ?Sized> CompletionClient for Arc<C> {
    async fn complete_batch(&self, window: &[Message]) -> Result<String> {
        (**self).complete_batch(window).await
    }

    async fn complete_stream(&self, window: &[Message]) -> Result<String> {
        (**self).complete_stream(window).await
    }
}

/// Lifecycle of a single completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Sent,
    Streaming,
    Completed,
    Done,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Done | RequestState::Failed)
    }

    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Idle, Sent) => true,
            (Sent, Streaming) | (Sent, Completed) => true,
            (Streaming, Done) | (Completed, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestState::Idle => "idle",
            RequestState::Sent => "sent",
            RequestState::Streaming => "streaming",
            RequestState::Completed => "completed",
            RequestState::Done => "done",
            RequestState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Records the transitions of one request and rejects illegal ones.
#[derive(Debug)]
pub struct RequestLifecycle {
    transitions: Vec<RequestState>,
}

impl Default for RequestLifecycle {
    fn default() -> Self {
        Self {
            transitions: vec![RequestState::Idle],
        }
    }
}

impl RequestLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RequestState {
        *self.transitions.last().unwrap_or(&RequestState::Idle)
    }

    pub fn transitions(&self) -> &[RequestState] {
        &self.transitions
    }

    pub fn advance(&mut self, next: RequestState) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(PersonaError::Protocol(format!(
                "illegal request transition {current} -> {next}"
            )));
        }
        tracing::debug!(from = %current, to = %next, "completion request transition");
        self.transitions.push(next);
        Ok(())
    }

    /// Move to `Done` on success or `Failed` on error and hand the outcome back.
    pub fn settle(&mut self, outcome: Result<String>) -> Result<String> {
        match outcome {
            Ok(reply) => {
                self.advance(RequestState::Done)?;
                Ok(reply)
            }
            Err(err) => {
                if !self.state().is_terminal() {
                    self.transitions.push(RequestState::Failed);
                }
                tracing::warn!(error = %err, "completion request failed");
                Err(err)
            }
        }
    }
}

/// Fixed sampling parameters sent with every request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub stop: Option<Vec<String>>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self::from(&ModelConfig::default())
    }
}

impl From<&ModelConfig> for SamplingParams {
    fn from(cfg: &ModelConfig) -> Self {
        Self {
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            max_tokens: cfg.max_tokens,
            stop: None,
        }
    }
}

fn coalesce_error(status: reqwest::StatusCode, body: &str, provider: &str) -> PersonaError {
    match status {
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
            PersonaError::Backend(format!("{provider} authentication failed ({status}): {body}"))
        }
        reqwest::StatusCode::TOO_MANY_REQUESTS => {
            PersonaError::Backend(format!("{provider} rate limit exceeded: {body}"))
        }
        _ => PersonaError::Backend(format!("{provider} request failed with {status}: {body}")),
    }
}

/// Client for Groq's OpenAI-compatible chat completions API. Any other
/// OpenAI-compatible endpoint works through `with_base_url`.
#[derive(Clone)]
pub struct GroqClient {
    http: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
    sampling: SamplingParams,
}

impl fmt::Debug for GroqClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroqClient")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("sampling", &self.sampling)
            .finish_non_exhaustive()
    }
}

impl GroqClient {
    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .or_else(|| std::env::var("GROQ_API_KEY").ok())
            .ok_or_else(|| {
                PersonaError::Config(
                    "missing Groq API key: set model.api_key or GROQ_API_KEY".into(),
                )
            })?;
        let base_url = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| GROQ_BASE_URL.to_string());
        let mut http = reqwest::Client::builder();
        if let Some(secs) = cfg.timeout_secs {
            http = http.timeout(Duration::from_secs(secs));
        }
        Ok(Self {
            http: http
                .build()
                .map_err(|err| PersonaError::Config(format!("http client error: {err}")))?,
            model: cfg.model.clone(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            sampling: SamplingParams::from(cfg),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(&ModelConfig::default())
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(
        &self,
        window: &[Message],
        stream: bool,
        lifecycle: &mut RequestLifecycle,
    ) -> Result<reqwest::Response> {
        let payload = ChatCompletionRequest {
            model: &self.model,
            messages: window,
            temperature: self.sampling.temperature,
            top_p: self.sampling.top_p,
            max_tokens: self.sampling.max_tokens,
            stop: self.sampling.stop.as_deref(),
            stream,
        };

        lifecycle.advance(RequestState::Sent)?;
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| PersonaError::Backend(format!("Groq request error: {err}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(coalesce_error(status, &body, "Groq"));
        }
        Ok(resp)
    }

    async fn run_batch(
        &self,
        window: &[Message],
        lifecycle: &mut RequestLifecycle,
    ) -> Result<String> {
        let resp = self.send(window, false, lifecycle).await?;
        let body: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|err| PersonaError::Backend(format!("Groq response parse error: {err}")))?;

        let first = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| PersonaError::Backend("Groq returned no choices".into()))?;
        let content = first
            .message
            .content
            .ok_or_else(|| PersonaError::Backend("Groq response contained no content".into()))?;

        lifecycle.advance(RequestState::Completed)?;
        Ok(content)
    }

    async fn run_stream(
        &self,
        window: &[Message],
        lifecycle: &mut RequestLifecycle,
    ) -> Result<String> {
        let resp = self.send(window, true, lifecycle).await?;
        lifecycle.advance(RequestState::Streaming)?;

        let mut decoder = SseDecoder::new();
        let mut assembler = StreamAssembler::new();
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|err| PersonaError::Backend(format!("Groq stream error: {err}")))?;
            for event in decoder.push(&chunk) {
                apply_event(&mut assembler, event)?;
            }
            if assembler.is_finished() {
                break;
            }
        }
        if let Some(event) = decoder.finish() {
            apply_event(&mut assembler, event)?;
        }

        tracing::debug!(fragments = assembler.fragments(), "completion stream closed");
        assembler.finish()
    }
}

fn apply_event(assembler: &mut StreamAssembler, event: SseEvent) -> Result<()> {
    match event {
        SseEvent::Done => assembler.mark_finished(),
        SseEvent::Data(data) => {
            let parsed: ChatCompletionChunk = serde_json::from_str(&data).map_err(|err| {
                PersonaError::Backend(format!("Groq stream parse error `{data}`: {err}"))
            })?;
            if let Some(error) = parsed.error {
                return Err(PersonaError::Backend(format!(
                    "Groq stream error: {}",
                    error_message(&error)
                )));
            }
            if let Some(choice) = parsed.choices.into_iter().next() {
                assembler.push(choice.delta.content.as_deref());
                if choice.finish_reason.is_some() {
                    assembler.mark_finished();
                }
            }
        }
    }
    Ok(())
}

/// Pull a readable message out of an OpenAI-style `error` payload, which may
/// be an object with `message` or a bare string.
fn error_message(error: &serde_json::Value) -> String {
    error
        .get("message")
        .and_then(serde_json::Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

#[async_trait]
impl CompletionClient for GroqClient {
    async fn complete_batch(&self, window: &[Message]) -> Result<String> {
        let span = tracing::info_span!(
            "completion",
            model = %self.model,
            mode = "batch",
            messages = window.len()
        );
        async move {
            let mut lifecycle = RequestLifecycle::new();
            let outcome = self.run_batch(window, &mut lifecycle).await;
            lifecycle.settle(outcome)
        }
        .instrument(span)
        .await
    }

    async fn complete_stream(&self, window: &[Message]) -> Result<String> {
        let span = tracing::info_span!(
            "completion",
            model = %self.model,
            mode = "stream",
            messages = window.len()
        );
        async move {
            let mut lifecycle = RequestLifecycle::new();
            let outcome = self.run_stream(window, &mut lifecycle).await;
            lifecycle.settle(outcome)
        }
        .instrument(span)
        .await
    }
}

/// One scripted outcome for [`StubModel`].
#[derive(Debug, Clone, PartialEq)]
pub enum StubReply {
    Text(String),
    Fragments(Vec<String>),
    Fail(String),
}

/// A deterministic model used for tests and demos. Replies are consumed in
/// order; every received window is recorded.
#[derive(Debug, Default)]
pub struct StubModel {
    replies: Mutex<VecDeque<StubReply>>,
    windows: Mutex<Vec<Vec<Message>>>,
}

impl StubModel {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Self::scripted(responses.into_iter().map(StubReply::Text).collect())
    }

    pub fn scripted(replies: Vec<StubReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            windows: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: StubReply) {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(reply);
    }

    /// Context windows received so far, oldest first.
    pub fn windows(&self) -> Vec<Vec<Message>> {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn next_reply(&self, window: &[Message]) -> Result<StubReply> {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(window.to_vec());
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .ok_or_else(|| PersonaError::Backend("StubModel ran out of scripted responses".into()))
    }
}

#[async_trait]
impl CompletionClient for StubModel {
    async fn complete_batch(&self, window: &[Message]) -> Result<String> {
        match self.next_reply(window)? {
            StubReply::Text(text) => Ok(text),
            StubReply::Fragments(fragments) => Ok(fragments.concat()),
            StubReply::Fail(reason) => Err(PersonaError::Backend(reason)),
        }
    }

    async fn complete_stream(&self, window: &[Message]) -> Result<String> {
        let fragments = match self.next_reply(window)? {
            StubReply::Text(text) => vec![text],
            StubReply::Fragments(fragments) => fragments,
            StubReply::Fail(reason) => return Err(PersonaError::Backend(reason)),
        };
        collect_fragments(stream::iter(fragments.into_iter().map(|f| Ok(Some(f))))).await
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    stop: Option<&'a [String]>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChatDeltaChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatDeltaChoice {
    #[serde(default)]
    delta: ChatDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_follows_streaming_path() {
        let mut lifecycle = RequestLifecycle::new();
        lifecycle.advance(RequestState::Sent).unwrap();
        lifecycle.advance(RequestState::Streaming).unwrap();
        let reply = lifecycle.settle(Ok("Hello".into())).unwrap();

        assert_eq!(reply, "Hello");
        assert_eq!(
            lifecycle.transitions(),
            [
                RequestState::Idle,
                RequestState::Sent,
                RequestState::Streaming,
                RequestState::Done
            ]
        );
    }

    #[test]
    fn lifecycle_failure_is_terminal() {
        let mut lifecycle = RequestLifecycle::new();
        lifecycle.advance(RequestState::Sent).unwrap();
        let err = lifecycle
            .settle(Err(PersonaError::Backend("401".into())))
            .unwrap_err();

        assert!(err.is_backend());
        assert_eq!(lifecycle.state(), RequestState::Failed);
        assert!(lifecycle.advance(RequestState::Sent).is_err());
        assert!(lifecycle.advance(RequestState::Done).is_err());
    }

    #[test]
    fn lifecycle_rejects_skipping_send() {
        let mut lifecycle = RequestLifecycle::new();
        assert!(lifecycle.advance(RequestState::Completed).is_err());
        assert!(!RequestState::Completed.can_transition_to(RequestState::Streaming));
        assert!(!RequestState::Done.can_transition_to(RequestState::Failed));
    }

    #[test]
    fn default_sampling_matches_fixed_parameters() {
        let params = SamplingParams::default();
        assert_eq!(params.temperature, 1.0);
        assert_eq!(params.top_p, 1.0);
        assert_eq!(params.max_tokens, 1024);
        assert_eq!(params.stop, None);
    }

    #[test]
    fn request_serializes_null_stop() {
        let messages = vec![Message::system("You are X"), Message::user("Hi")];
        let request = ChatCompletionRequest {
            model: "llama3-70b-8192",
            messages: &messages,
            temperature: 1.0,
            top_p: 1.0,
            max_tokens: 1024,
            stop: None,
            stream: true,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["stop"], serde_json::Value::Null);
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["stream"], true);
    }

    #[test]
    fn stream_events_feed_the_assembler() {
        let mut assembler = StreamAssembler::new();
        for data in [
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":null}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
        ] {
            apply_event(&mut assembler, SseEvent::Data(data.into())).unwrap();
        }
        assert_eq!(assembler.finish().unwrap(), "Hello");
    }

    #[test]
    fn stream_error_payload_keeps_backend_message() {
        let mut assembler = StreamAssembler::new();
        apply_event(
            &mut assembler,
            SseEvent::Data(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#.into()),
        )
        .unwrap();
        let err = apply_event(
            &mut assembler,
            SseEvent::Data(
                r#"{"error":{"message":"model overloaded","type":"server_error"}}"#.into(),
            ),
        )
        .unwrap_err();
        match err {
            PersonaError::Backend(reason) => assert!(reason.contains("model overloaded")),
            other => panic!("unexpected error: {other}"),
        }

        let err = apply_event(
            &mut assembler,
            SseEvent::Data(r#"{"error":"quota exhausted"}"#.into()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("quota exhausted"));
    }

    #[test]
    fn malformed_stream_event_is_a_backend_error() {
        let mut assembler = StreamAssembler::new();
        let err = apply_event(&mut assembler, SseEvent::Data("{oops".into())).unwrap_err();
        assert!(err.is_backend());
    }

    #[tokio::test]
    async fn stub_streams_fragments() {
        let model = StubModel::scripted(vec![StubReply::Fragments(vec![
            "Hel".into(),
            "lo".into(),
            " world".into(),
        ])]);
        let reply = model.complete(&[Message::user("Hi")], true).await.unwrap();
        assert_eq!(reply, "Hello world");
        assert_eq!(model.windows(), vec![vec![Message::user("Hi")]]);
    }

    #[tokio::test]
    async fn stub_failure_propagates() {
        let model = StubModel::scripted(vec![StubReply::Fail("boom".into())]);
        let err = model.complete(&[], false).await.unwrap_err();
        assert!(matches!(err, PersonaError::Backend(reason) if reason == "boom"));
        assert!(model.complete(&[], false).await.is_err());
    }
}
