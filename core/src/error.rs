use std::io;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, ScoutErr>;

#[derive(Error, Debug)]
pub enum ScoutErr {
    /// The SSE stream disconnected or stalled after the HTTP handshake
    /// succeeded. Treated as transient; the retry loop takes another turn.
    /// Optionally carries the provider-requested delay before retrying.
    #[error("stream disconnected before completion: {0}")]
    Stream(String, Option<Duration>),

    /// The provider rejected the request because the conversation no longer
    /// fits its context window. Triggers one compaction attempt.
    #[error("context window exceeded: {0}")]
    ContextOverflow(String),

    /// Non-retryable provider rejection (auth, invalid request, content
    /// policy). Carries the status and response body.
    #[error("provider rejected request ({0}): {1}")]
    Fatal(StatusCode, String),

    /// Retry budget exhausted against a provider, carrying the last HTTP
    /// status seen. Network-level exhaustion (no status ever) surfaces the
    /// underlying error instead.
    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    /// The per-operation timeout elapsed.
    #[error("operation timed out after {0:?}")]
    OperationTimeout(Duration),

    /// The session cancellation token fired.
    #[error("interrupted")]
    Interrupted,

    /// Agent submission loop died unexpectedly.
    #[error("internal error; agent loop died unexpectedly")]
    InternalAgentDied,

    #[error("{0}")]
    EnvVar(EnvVarError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl ScoutErr {
    /// Whether another attempt — or the fallback provider — may still
    /// succeed after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScoutErr::Stream(..) | ScoutErr::Reqwest(_) | ScoutErr::RetryLimit(_)
        )
    }
}

#[derive(Debug)]
pub struct EnvVarError {
    /// Name of the missing environment variable.
    pub var: String,
    /// Optional instructions for obtaining a value.
    pub instructions: Option<String>,
}

impl std::fmt::Display for EnvVarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Missing environment variable: `{}`.", self.var)?;
        if let Some(instructions) = &self.instructions {
            write!(f, " {instructions}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn env_var_error_formats_with_instructions() {
        let error = EnvVarError {
            var: "OPENAI_API_KEY".to_string(),
            instructions: Some("Create a key at platform.openai.com.".to_string()),
        };
        assert_eq!(
            error.to_string(),
            "Missing environment variable: `OPENAI_API_KEY`. Create a key at platform.openai.com."
        );
    }

    #[test]
    fn stream_errors_are_retryable_and_fatal_errors_are_not() {
        assert!(ScoutErr::Stream("idle timeout".to_string(), None).is_retryable());
        // An exhausted provider is still worth handing to the fallback.
        assert!(ScoutErr::RetryLimit(StatusCode::SERVICE_UNAVAILABLE).is_retryable());
        assert!(!ScoutErr::Fatal(StatusCode::UNAUTHORIZED, "bad key".to_string()).is_retryable());
    }
}
