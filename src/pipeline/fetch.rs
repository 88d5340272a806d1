use crate::database::ProxyDatabase;
use crate::error::{PipelineError, ValidationError};
use crate::pipeline::{fanin, run_workers, FetchReport, Pipeline};
use crate::progress::{Counter, Progress, Stage};
use crate::proxy::checker::ProxyChecker;
use crate::proxy::parser::LinkDecoder;
use crate::source::SourceEvent;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

impl Pipeline {
    /// Fetch links from the named sources (all enabled ones when empty),
    /// validate them and store the new ones
    ///
    /// Cancelling `cancel` ends the run early with `cancelled` set in the
    /// report; whatever was stored until then stays.
    pub async fn fetch(
        &self,
        names: &[String],
        cancel: &CancellationToken,
    ) -> Result<FetchReport, PipelineError> {
        let sources = self.registry.select(names)?;
        let progress = self.progress();
        let span = info_span!("fetch", run = %Uuid::new_v4());

        async move {
            info!(sources = sources.len(), workers = self.options.workers, "fetch started");
            let run = cancel.child_token();
            progress.set_stage(Stage::Fetching);

            let (rx, sources_done) = fanin::spawn_sources(
                sources,
                self.options.channel_capacity,
                run.clone(),
                Arc::clone(&progress),
            );

            let worker = {
                let checker = Arc::clone(&self.checker);
                let db = self.db.clone();
                let progress = Arc::clone(&progress);
                let run = run.clone();
                move |event: SourceEvent| {
                    let checker = Arc::clone(&checker);
                    let db = db.clone();
                    let progress = Arc::clone(&progress);
                    let run = run.clone();
                    async move { handle_event(event, &checker, &db, &progress, &run).await }
                }
            };

            let result = run_workers(self.options.workers, rx, &run, worker).await;
            // a failed worker cancelled `run`, so sources are winding down too
            let sources = sources_done.await?;
            progress.set_stage(Stage::Done);
            result?;

            let report = FetchReport {
                progress: progress.snapshot(),
                sources,
                cancelled: cancel.is_cancelled(),
            };
            info!(
                total = report.progress.total,
                created = report.progress.created,
                duplicate = report.progress.duplicate,
                invalid = report.progress.invalid,
                failed = report.progress.failed,
                cancelled = report.cancelled,
                "fetch finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

async fn handle_event(
    event: SourceEvent,
    checker: &ProxyChecker,
    db: &ProxyDatabase,
    progress: &Progress,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    match event {
        SourceEvent::Done { source, error } => {
            progress.source_done(&source);
            match error {
                Some(e) => warn!(source = %source, error = %e, "source failed"),
                None => debug!(source = %source, "source finished"),
            }
            Ok(())
        }
        SourceEvent::Link { source, link } => {
            progress.advance(Stage::Fetching, Stage::Processing);
            progress.incr(Counter::Total);
            let result = process_link(&source, &link, checker, db, progress, cancel).await;
            progress.incr(Counter::Completed);
            result
        }
    }
}

/// Decode, validate and store one link; only storage errors escape
async fn process_link(
    source: &str,
    link: &str,
    checker: &ProxyChecker,
    db: &ProxyDatabase,
    progress: &Progress,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let descriptor = match LinkDecoder::decode_from(source, link) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            trace!(source, error = %e, "dropping undecodable link");
            progress.incr(Counter::Invalid);
            return Ok(());
        }
    };

    let record = match checker.validate(descriptor, cancel).await {
        Ok(record) => record,
        Err(ValidationError::Cancelled) => return Ok(()),
        Err(e) => {
            trace!(source, error = %e, "validation failed");
            progress.incr(Counter::Failed);
            return Ok(());
        }
    };

    if cancel.is_cancelled() {
        return Ok(());
    }

    let (stored, created) = db.create(&record).await?;
    if created {
        progress.incr(Counter::Created);
        progress.incr(if stored.has_country() {
            Counter::CountrySet
        } else {
            Counter::CountryEmpty
        });
        debug!(id = stored.id, proxy = %record.descriptor, delay = stored.delay, "stored proxy");
    } else {
        progress.incr(Counter::Duplicate);
    }

    Ok(())
}
