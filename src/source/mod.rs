//! Link sources
//!
//! A source yields raw share-links through a [`LinkEmitter`]. Sources are
//! registered by name in a [`SourceRegistry`] built at startup and handed to
//! the pipeline.

pub mod crawler;

use crate::config::{SourceConfig, SourceKind};
use crate::error::{PipelineError, SourceError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use crawler::{CrawlerConfig, FileSource, PageSource, SubscriptionSource};

/// Message sent from sources to the pipeline
#[derive(Debug)]
pub enum SourceEvent {
    Link { source: Arc<str>, link: String },
    /// Sent exactly once per source, after its last link
    Done {
        source: Arc<str>,
        error: Option<SourceError>,
    },
}

/// Handle through which a source pushes links into the shared channel
#[derive(Debug, Clone)]
pub struct LinkEmitter {
    source: Arc<str>,
    tx: mpsc::Sender<SourceEvent>,
    emitted: Arc<AtomicU64>,
}

impl LinkEmitter {
    pub fn new(source: Arc<str>, tx: mpsc::Sender<SourceEvent>) -> Self {
        Self {
            source,
            tx,
            emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Links accepted by the channel so far, across clones
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Send one link, waiting while the workers are busy
    pub async fn emit(&self, link: impl Into<String>) -> Result<(), SourceError> {
        self.tx
            .send(SourceEvent::Link {
                source: Arc::clone(&self.source),
                link: link.into(),
            })
            .await
            .map_err(|_| SourceError::Cancelled)?;
        self.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Something that yields raw share-links
#[async_trait]
pub trait SourceExecutor: Send + Sync {
    /// Emit every link found; return when done, on error, or once `cancel` fires
    async fn execute(&self, cancel: CancellationToken, emitter: LinkEmitter) -> Result<(), SourceError>;
}

/// A named executor with its own time box
#[derive(Clone)]
pub struct RegisteredSource {
    pub name: Arc<str>,
    pub timeout: Duration,
    pub enabled: bool,
    pub executor: Arc<dyn SourceExecutor>,
}

impl std::fmt::Debug for RegisteredSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredSource")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Name to executor table
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, RegisteredSource>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` under `name`, replacing any previous entry
    pub fn register(
        &mut self,
        name: impl Into<String>,
        timeout: Duration,
        executor: Arc<dyn SourceExecutor>,
    ) -> &mut Self {
        let name = name.into();
        self.sources.insert(
            name.clone(),
            RegisteredSource {
                name: Arc::from(name),
                timeout,
                enabled: true,
                executor,
            },
        );
        self
    }

    /// Build the table from configured sources
    pub fn from_config(sources: &[SourceConfig], crawler: &CrawlerConfig) -> crate::Result<Self> {
        let mut registry = Self::new();
        for source in sources {
            let executor: Arc<dyn SourceExecutor> = match source.kind {
                SourceKind::Subscription => {
                    Arc::new(SubscriptionSource::new(&source.location, crawler)?)
                }
                SourceKind::Page => Arc::new(PageSource::new(&source.location, crawler)?),
                SourceKind::File => Arc::new(FileSource::new(&source.location)),
            };
            registry.register(&source.name, Duration::from_secs(source.timeout_secs), executor);
            if let Some(entry) = registry.sources.get_mut(&source.name) {
                entry.enabled = source.enabled;
            }
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredSource> {
        self.sources.get(name)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Resolve `names` to sources; an empty list selects every enabled source
    ///
    /// Explicitly named sources run even when disabled in the config.
    pub fn select(&self, names: &[String]) -> Result<Vec<RegisteredSource>, PipelineError> {
        if names.is_empty() {
            return Ok(self.sources.values().filter(|s| s.enabled).cloned().collect());
        }

        names
            .iter()
            .map(|name| {
                self.sources
                    .get(name)
                    .cloned()
                    .ok_or_else(|| PipelineError::UnknownSource(name.clone()))
            })
            .collect()
    }
}
