//! Error taxonomy of the ingestion pipeline
//!
//! Per-item errors ([`DecodeError`], [`ValidationError`], [`SourceError`]) are
//! absorbed at the worker boundary and only counted. [`PipelineError`] ends the
//! enclosing run and is surfaced to the caller.

use std::time::Duration;
use thiserror::Error;

/// A share-link could not be turned into a descriptor
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid link: {0}")]
    InvalidLink(String),
    #[error("payload is not valid base64")]
    Base64,
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid uri: {0}")]
    Url(#[from] url::ParseError),
}

impl DecodeError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidLink(reason.into())
    }
}

/// A descriptor did not pass the reachability probe
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("connector rejected proxy: {0}")]
    Connect(String),
    #[error("url test failed: {0}")]
    Probe(String),
    #[error("url test timed out after {0:?}")]
    Timeout(Duration),
    #[error("url test reported zero delay")]
    ZeroDelay,
    #[error("validation cancelled")]
    Cancelled,
}

/// Failure of a single source, reported through its done sentinel
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Errors fatal to a whole fetch or tidy run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown source: {0}")]
    UnknownSource(String),
    #[error("network preflight failed: {0}")]
    NetworkPreflight(String),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("run cancelled")]
    Cancelled,
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
