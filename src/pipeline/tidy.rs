use crate::database::ProxyDatabase;
use crate::error::{PipelineError, ValidationError};
use crate::models::{ProxyQuery, StoredProxy};
use crate::pipeline::{run_workers, Pipeline, TidyReport};
use crate::progress::{Counter, Progress, Stage};
use crate::proxy::checker::ProxyChecker;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

impl Pipeline {
    /// Re-validate every stored proxy, removing dead ones and refreshing
    /// delay and country of the rest
    ///
    /// Nothing is loaded or touched unless the direct network check passes.
    pub async fn tidy(&self, cancel: &CancellationToken) -> Result<TidyReport, PipelineError> {
        let progress = self.progress();
        let span = info_span!("tidy", run = %Uuid::new_v4());

        async move {
            let run = cancel.child_token();
            progress.set_stage(Stage::Fetching);

            match self.checker.check_network(&run).await {
                Ok(()) => {}
                Err(PipelineError::Cancelled) => {
                    progress.set_stage(Stage::Done);
                    return Ok(TidyReport {
                        progress: progress.snapshot(),
                        cancelled: true,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "network check failed, leaving stored proxies untouched");
                    progress.set_stage(Stage::Done);
                    return Err(e);
                }
            }

            let proxies = self.db.get_proxies(&ProxyQuery::new()).await?;
            info!(proxies = proxies.len(), workers = self.options.workers, "tidy started");
            progress.add(Counter::Total, proxies.len() as u64);
            progress.set_stage(Stage::Processing);

            let (tx, rx) = mpsc::channel(self.options.channel_capacity.max(1));
            let feeder = {
                let run = run.clone();
                let progress = Arc::clone(&progress);
                tokio::spawn(async move {
                    for proxy in proxies {
                        tokio::select! {
                            _ = run.cancelled() => break,
                            sent = tx.send(proxy) => if sent.is_err() { break },
                        }
                    }
                    progress.advance(Stage::Processing, Stage::Draining);
                })
            };

            let worker = {
                let checker = Arc::clone(&self.checker);
                let db = self.db.clone();
                let progress = Arc::clone(&progress);
                let run = run.clone();
                move |proxy: StoredProxy| {
                    let checker = Arc::clone(&checker);
                    let db = db.clone();
                    let progress = Arc::clone(&progress);
                    let run = run.clone();
                    async move { tidy_proxy(proxy, &checker, &db, &progress, &run).await }
                }
            };

            let result = run_workers(self.options.workers, rx, &run, worker).await;
            feeder.await?;
            progress.set_stage(Stage::Done);
            result?;

            let report = TidyReport {
                progress: progress.snapshot(),
                cancelled: cancel.is_cancelled(),
            };
            info!(
                total = report.progress.total,
                succeeded = report.progress.succeeded,
                removed = report.progress.removed,
                country_set = report.progress.country_set,
                country_empty = report.progress.country_empty,
                cancelled = report.cancelled,
                "tidy finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

async fn tidy_proxy(
    mut proxy: StoredProxy,
    checker: &ProxyChecker,
    db: &ProxyDatabase,
    progress: &Progress,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Ok(());
    }

    let descriptor = match proxy.descriptor() {
        Ok(descriptor) => descriptor,
        Err(e) => {
            warn!(id = proxy.id, error = %e, "removing unreadable record");
            db.remove(proxy.id).await?;
            progress.incr(Counter::Removed);
            progress.incr(Counter::Completed);
            return Ok(());
        }
    };

    match checker.probe(&descriptor, cancel).await {
        Err(ValidationError::Cancelled) => return Ok(()),
        Err(e) => {
            if cancel.is_cancelled() {
                return Ok(());
            }
            debug!(id = proxy.id, proxy = %descriptor, error = %e, "removing dead proxy");
            db.remove(proxy.id).await?;
            progress.incr(Counter::Failed);
            progress.incr(Counter::Removed);
        }
        Ok(delay) => {
            let country = if proxy.has_country() {
                proxy.country()
            } else {
                checker.lookup_country(&proxy.server, cancel).await
            };
            if cancel.is_cancelled() {
                return Ok(());
            }

            proxy.apply(delay, &country);
            db.update(&proxy).await?;
            progress.incr(Counter::Succeeded);
            progress.incr(if proxy.has_country() {
                Counter::CountrySet
            } else {
                Counter::CountryEmpty
            });
        }
    }

    progress.incr(Counter::Completed);
    Ok(())
}
