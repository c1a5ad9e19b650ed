use std::path::PathBuf;

use thiserror::Error;

/// Session-level error type for DeepDive.
///
/// Only invalid input, configuration problems and a failed synthesis ever
/// reach the caller; every per-unit failure inside a round is absorbed.
#[derive(Debug, Error)]
pub enum DeepDiveError {
    #[error("invalid session: {0}")]
    InvalidSession(String),
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeepDiveError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }

    pub fn invalid_session(reason: impl Into<String>) -> Self {
        Self::InvalidSession(reason.into())
    }
}

/// Failure of a search backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timed out")]
    Timeout,
    #[error("backend rate limited")]
    RateLimited,
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Failure to retrieve or decode a page body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("fetch timed out")]
    Timeout,
    #[error("fetch blocked: {0}")]
    Blocked(String),
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Failure of the language-model capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmError {
    #[error("language model unavailable: {0}")]
    Unavailable(String),
    #[error("language model timed out")]
    Timeout,
}

/// Planner output that could not be acted on. Always handled by stopping
/// the loop and synthesizing with what exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlannerError {
    #[error("malformed planner output: {0}")]
    Malformed(String),
    #[error("planner returned no usable sub-queries")]
    Empty,
    #[error(transparent)]
    Llm(#[from] LlmError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    #[error("synthesis unavailable: {0}")]
    Unavailable(String),
}

impl From<LlmError> for SynthesisError {
    fn from(err: LlmError) -> Self {
        Self::Unavailable(err.to_string())
    }
}
