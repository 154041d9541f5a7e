//! Provider client: one LLM call with retry, backoff, and fallback.
//!
//! A call streams the assistant message over SSE, bounded by three
//! timeouts: per-request (connection + handshake), stream-activity (the
//! longest silence tolerated between events), and per-operation (the whole
//! call including every retry). Transient failures — network errors, 5xx,
//! 429 — retry with jittered exponential backoff; after the primary's
//! retry budget is spent the declared fallback provider gets its own pass.
//! Auth, invalid-request, and context-overflow errors fail fast.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::error::Result;
use crate::error::ScoutErr;
use crate::flags::ENGINE_ACTIVITY_TIMEOUT;
use crate::flags::MAX_OPERATION_TIMEOUT;
use crate::flags::REQUEST_TIMEOUT;
use crate::flags::SCOUT_REQUEST_MAX_RETRIES;
use crate::history::is_context_overflow;
use crate::models::ChatMessage;
use crate::provider::ModelProviderInfo;
use crate::util::backoff;

#[derive(Debug, Serialize)]
struct ChatPayload<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    delta: Option<ChatDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatDelta {
    content: Option<String>,
}

#[derive(Clone)]
pub struct ModelClient {
    model: String,
    provider: ModelProviderInfo,
    fallback: Option<ModelProviderInfo>,
    client: reqwest::Client,
    /// Extra provider phrasings that indicate context overflow, beyond the
    /// built-in table.
    extra_overflow_markers: Vec<String>,
}

impl ModelClient {
    pub fn new(
        model: impl Into<String>,
        provider: ModelProviderInfo,
        fallback: Option<ModelProviderInfo>,
    ) -> Self {
        Self {
            model: model.into(),
            provider,
            fallback,
            client: reqwest::Client::new(),
            extra_overflow_markers: Vec::new(),
        }
    }

    pub fn with_overflow_markers(mut self, markers: Vec<String>) -> Self {
        self.extra_overflow_markers = markers;
        self
    }

    /// One logical LLM call: the full conversation in, the assistant text
    /// out. Retries and provider fallback happen inside; the whole thing
    /// is bounded by the per-operation timeout.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let operation_timeout = *MAX_OPERATION_TIMEOUT;
        match timeout(operation_timeout, self.complete_inner(messages, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(ScoutErr::OperationTimeout(operation_timeout)),
        }
    }

    async fn complete_inner(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<String> {
        match self.attempt_provider(&self.provider, messages, cancel).await {
            Ok(text) => Ok(text),
            Err(error) if error.is_retryable() => match &self.fallback {
                Some(fallback) => {
                    warn!(
                        provider = %self.provider.name,
                        fallback = %fallback.name,
                        "primary provider exhausted retries; falling back"
                    );
                    self.attempt_provider(fallback, messages, cancel).await
                }
                None => Err(error),
            },
            Err(error) => Err(error),
        }
    }

    async fn attempt_provider(
        &self,
        provider: &ModelProviderInfo,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let max_retries = *SCOUT_REQUEST_MAX_RETRIES;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.one_call(provider, messages, cancel).await {
                Ok(text) => return Ok(text),
                Err(failure) if failure.error.is_retryable() => {
                    if attempt > max_retries {
                        // Status-shaped exhaustion reports the retry limit;
                        // network-level exhaustion surfaces the last error.
                        return Err(match failure.status {
                            Some(status) => ScoutErr::RetryLimit(status),
                            None => failure.error,
                        });
                    }
                    let delay = match &failure.error {
                        ScoutErr::Stream(_, Some(delay)) => *delay,
                        _ => backoff(attempt),
                    };
                    warn!(
                        provider = %provider.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient provider error: {}; retrying",
                        failure.error
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ScoutErr::Interrupted),
                    }
                }
                Err(failure) => return Err(failure.error),
            }
        }
    }

    async fn one_call(
        &self,
        provider: &ModelProviderInfo,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> std::result::Result<String, CallFailure> {
        let api_key = provider.api_key().map_err(CallFailure::from_error)?;
        let url = format!("{}/chat/completions", provider.base_url);
        let payload = ChatPayload {
            model: &self.model,
            messages,
            stream: true,
        };
        debug!(url, provider = %provider.name, "POST");
        trace!(
            "request payload: {}",
            serde_json::to_string(&payload).map_err(CallFailure::from_error)?
        );

        let mut request = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&payload);
        if let Some(api_key) = api_key {
            request = request.bearer_auth(api_key);
        }

        let response = tokio::select! {
            sent = timeout(*REQUEST_TIMEOUT, request.send()) => match sent {
                Ok(Ok(response)) => response,
                Ok(Err(error)) => return Err(CallFailure::from_error(error)),
                Err(_) => {
                    return Err(CallFailure::from_error(ScoutErr::Stream(
                        format!("request timed out after {:?}", *REQUEST_TIMEOUT),
                        None,
                    )));
                }
            },
            _ = cancel.cancelled() => return Err(CallFailure::from_error(ScoutErr::Interrupted)),
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(CallFailure {
                error: classify_failure(status, body, retry_after, &self.extra_overflow_markers),
                status: Some(status),
            });
        }

        self.consume_stream(response, cancel)
            .await
            .map_err(CallFailure::from_error)
    }

    /// Accumulate delta text until `[DONE]` or end of stream. A silence
    /// longer than the activity timeout abandons the request (dropping the
    /// response cancels it) and reports a retryable stream error.
    async fn consume_stream(
        &self,
        response: reqwest::Response,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let idle_timeout = *ENGINE_ACTIVITY_TIMEOUT;
        let mut stream = response.bytes_stream().eventsource();
        let mut text = String::new();
        let mut finished = false;

        loop {
            let next = tokio::select! {
                event = timeout(idle_timeout, stream.next()) => event,
                _ = cancel.cancelled() => return Err(ScoutErr::Interrupted),
            };
            let event = match next {
                Ok(Some(Ok(event))) => event,
                Ok(Some(Err(error))) => {
                    return Err(ScoutErr::Stream(error.to_string(), None));
                }
                Ok(None) => break,
                Err(_) => {
                    return Err(ScoutErr::Stream(
                        format!("stream stalled for {idle_timeout:?}"),
                        None,
                    ));
                }
            };

            if event.data.trim() == "[DONE]" {
                finished = true;
                break;
            }
            let chunk: ChatChunk = match serde_json::from_str(&event.data) {
                Ok(chunk) => chunk,
                Err(error) => {
                    debug!("skipping unparsable SSE event: {error}");
                    continue;
                }
            };
            for choice in chunk.choices {
                if let Some(content) = choice.delta.and_then(|d| d.content) {
                    text.push_str(&content);
                }
                if choice.finish_reason.is_some() {
                    finished = true;
                }
            }
        }

        if text.is_empty() && !finished {
            return Err(ScoutErr::Stream(
                "stream closed before any content".to_string(),
                None,
            ));
        }
        Ok(text)
    }
}

/// One failed attempt, keeping the HTTP status around (when the failure
/// was status-shaped) so retry exhaustion can report it.
struct CallFailure {
    error: ScoutErr,
    status: Option<StatusCode>,
}

impl CallFailure {
    fn from_error(error: impl Into<ScoutErr>) -> Self {
        Self {
            error: error.into(),
            status: None,
        }
    }
}

/// Sort an HTTP failure into the retry taxonomy.
fn classify_failure(
    status: StatusCode,
    body: String,
    retry_after: Option<Duration>,
    extra_overflow_markers: &[String],
) -> ScoutErr {
    if is_context_overflow(&body, extra_overflow_markers) {
        return ScoutErr::ContextOverflow(body);
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return ScoutErr::Stream(format!("status {status}: {body}"), retry_after);
    }
    ScoutErr::Fatal(status, body)
}
