//! Fan-in of every source into one bounded channel

use crate::error::SourceError;
use crate::pipeline::SourceReport;
use crate::progress::{Progress, Stage};
use crate::source::{LinkEmitter, RegisteredSource, SourceEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Start every source on its own task
///
/// Returns the shared receiver and a handle resolving to one report per
/// source. The channel closes exactly once, after every source task ended:
/// only the tasks hold senders.
pub fn spawn_sources(
    sources: Vec<RegisteredSource>,
    capacity: usize,
    cancel: CancellationToken,
    progress: Arc<Progress>,
) -> (mpsc::Receiver<SourceEvent>, JoinHandle<Vec<SourceReport>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    progress.set_sources_total(sources.len());

    let mut set = JoinSet::new();
    for source in sources {
        set.spawn(run_source(source, tx.clone(), cancel.clone()));
    }
    drop(tx);

    let handle = tokio::spawn(async move {
        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => debug!(error = %e, "source task aborted"),
            }
        }
        if !progress.advance(Stage::Fetching, Stage::Draining) {
            progress.advance(Stage::Processing, Stage::Draining);
        }
        reports
    });

    (rx, handle)
}

/// Run one source inside its time box and send its done sentinel
async fn run_source(
    source: RegisteredSource,
    tx: mpsc::Sender<SourceEvent>,
    cancel: CancellationToken,
) -> SourceReport {
    let emitter = LinkEmitter::new(Arc::clone(&source.name), tx.clone());
    let execution = source.executor.execute(cancel.clone(), emitter.clone());

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(SourceError::Cancelled),
        result = tokio::time::timeout(source.timeout, execution) => match result {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(source.timeout)),
        },
    };

    let error = result.err();
    let report = SourceReport {
        name: source.name.to_string(),
        links: emitter.emitted(),
        error: error.as_ref().map(ToString::to_string),
    };

    let done = SourceEvent::Done {
        source: source.name,
        error,
    };
    // once cancelled nobody drains the channel, so never wait on it
    if cancel.is_cancelled() {
        let _ = tx.try_send(done);
    } else {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tx.send(done) => {}
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceExecutor;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Emit(Vec<&'static str>);

    #[async_trait]
    impl SourceExecutor for Emit {
        async fn execute(&self, _cancel: CancellationToken, emitter: LinkEmitter) -> Result<(), SourceError> {
            for link in &self.0 {
                emitter.emit(*link).await?;
            }
            Ok(())
        }
    }

    struct Never;

    #[async_trait]
    impl SourceExecutor for Never {
        async fn execute(&self, _cancel: CancellationToken, _emitter: LinkEmitter) -> Result<(), SourceError> {
            std::future::pending().await
        }
    }

    fn source(name: &str, timeout: Duration, executor: Arc<dyn SourceExecutor>) -> RegisteredSource {
        RegisteredSource {
            name: Arc::from(name),
            timeout,
            enabled: true,
            executor,
        }
    }

    #[tokio::test]
    async fn test_every_source_sends_one_done() {
        let sources = vec![
            source("a", Duration::from_secs(5), Arc::new(Emit(vec!["1", "2"]))),
            source("b", Duration::from_secs(5), Arc::new(Emit(vec!["3"]))),
            source("slow", Duration::from_millis(50), Arc::new(Never)),
        ];
        let progress = Arc::new(Progress::new());
        let (mut rx, handle) = spawn_sources(sources, 1, CancellationToken::new(), progress);

        let mut links = 0;
        let mut done = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                SourceEvent::Link { .. } => links += 1,
                SourceEvent::Done { source, error } => done.push((source.to_string(), error)),
            }
        }

        assert_eq!(links, 3);
        assert_eq!(done.len(), 3);
        let slow = done.iter().find(|(name, _)| name == "slow").unwrap();
        assert!(matches!(slow.1, Some(SourceError::Timeout(_))));

        let mut reports = handle.await.unwrap();
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(reports[0].links, 2);
        assert_eq!(reports[1].links, 1);
        assert!(reports[2].error.is_some());
    }

    #[tokio::test]
    async fn test_cancel_with_nobody_reading() {
        let sources = vec![
            source("a", Duration::from_secs(60), Arc::new(Emit(vec!["1", "2", "3", "4"]))),
            source("never", Duration::from_secs(60), Arc::new(Never)),
        ];
        let cancel = CancellationToken::new();
        let (rx, handle) = spawn_sources(sources, 1, cancel.clone(), Arc::new(Progress::new()));

        cancel.cancel();
        let reports = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sources should stop promptly")
            .unwrap();
        assert_eq!(reports.len(), 2);
        drop(rx);
    }
}
