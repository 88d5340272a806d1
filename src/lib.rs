//! Free proxy collector
//!
//! Pulls share-links (ss, ssr, vmess, trojan) from a set of sources, validates
//! them concurrently and keeps the reachable ones in a SQLite store that can be
//! re-validated and exported as Clash profiles.

pub mod config;
pub mod database;
pub mod error;
pub mod export;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod proxy;
pub mod source;
pub mod tui;

pub use config::AppConfig;
pub use database::ProxyDatabase;
pub use error::{DecodeError, PipelineError, SourceError, ValidationError};
pub use pipeline::{FetchReport, Pipeline, PipelineOptions, TidyReport};
pub use progress::{Progress, ProgressSnapshot, Stage};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
