//! Fetch and tidy workflows
//!
//! Both share the same shape: producers feed a bounded channel, a fixed pool
//! of workers drains it, and one [`CancellationToken`] governs the run. A
//! storage failure in any worker cancels the run and is returned.

pub mod fanin;
mod fetch;
mod tidy;

use crate::config::AppSection;
use crate::database::ProxyDatabase;
use crate::error::PipelineError;
use crate::progress::{Progress, ProgressSnapshot};
use crate::proxy::checker::ProxyChecker;
use crate::source::SourceRegistry;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const DEFAULT_WORKERS: usize = 100;
const DEFAULT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub workers: usize,
    pub channel_capacity: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl PipelineOptions {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

impl From<&AppSection> for PipelineOptions {
    fn from(app: &AppSection) -> Self {
        Self {
            workers: app.worker,
            channel_capacity: app.channel_capacity,
        }
    }
}

/// Outcome of one source during a fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub name: String,
    /// Links the source pushed into the pipeline
    pub links: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub progress: ProgressSnapshot,
    pub sources: Vec<SourceReport>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TidyReport {
    pub progress: ProgressSnapshot,
    pub cancelled: bool,
}

/// Wires sources, checker and store together
pub struct Pipeline {
    registry: SourceRegistry,
    checker: Arc<ProxyChecker>,
    db: ProxyDatabase,
    progress: Arc<Progress>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        registry: SourceRegistry,
        checker: ProxyChecker,
        db: ProxyDatabase,
        options: PipelineOptions,
    ) -> Self {
        Self {
            registry,
            checker: Arc::new(checker),
            db,
            progress: Arc::new(Progress::new()),
            options,
        }
    }

    /// Use `progress` as the run counters, e.g. one shared with a renderer
    pub fn with_progress(mut self, progress: Arc<Progress>) -> Self {
        self.progress = progress;
        self
    }

    /// Counters the runs of this pipeline report into
    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn database(&self) -> &ProxyDatabase {
        &self.db
    }
}

/// Drain `rx` with `workers` concurrent tasks running `work` per item
///
/// Workers stop when the channel closes or `cancel` fires. The first worker
/// error cancels `cancel` and is returned once every worker has exited.
pub(crate) async fn run_workers<T, F, Fut>(
    workers: usize,
    rx: mpsc::Receiver<T>,
    cancel: &CancellationToken,
    work: F,
) -> Result<(), PipelineError>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
{
    let rx = Arc::new(Mutex::new(rx));
    let mut set = JoinSet::new();

    for _ in 0..workers.max(1) {
        let rx = Arc::clone(&rx);
        let cancel = cancel.clone();
        let work = work.clone();
        set.spawn(async move {
            loop {
                let item = {
                    let mut rx = rx.lock().await;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        item = rx.recv() => item,
                    }
                };
                let Some(item) = item else {
                    return Ok(());
                };
                if let Err(e) = work(item).await {
                    cancel.cancel();
                    return Err(e);
                }
            }
        });
    }

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        let result = joined.map_err(PipelineError::from).and_then(|r| r);
        if let Err(e) = result {
            cancel.cancel();
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_workers_drain_channel() {
        let (tx, rx) = mpsc::channel(4);
        let seen = Arc::new(AtomicUsize::new(0));
        tokio::spawn(async move {
            for i in 0..100 {
                tx.send(i).await.unwrap();
            }
        });

        let counter = Arc::clone(&seen);
        run_workers(8, rx, &CancellationToken::new(), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn test_first_error_cancels_run() {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let producer_cancel = cancel.clone();
        let producer = tokio::spawn(async move {
            let mut i = 0;
            loop {
                tokio::select! {
                    _ = producer_cancel.cancelled() => break,
                    sent = tx.send(i) => if sent.is_err() { break },
                }
                i += 1;
            }
        });

        let err = run_workers(4, rx, &cancel, |i: u32| async move {
            if i == 10 {
                return Err(PipelineError::NetworkPreflight("boom".to_string()));
            }
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, PipelineError::NetworkPreflight(_)));
        assert!(cancel.is_cancelled());
        tokio::time::timeout(Duration::from_secs(5), producer)
            .await
            .unwrap()
            .unwrap();
    }
}
