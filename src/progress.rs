//! Run progress shared between pipeline workers and the dashboard

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Lifecycle of a fetch or tidy run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum Stage {
    Idle = 0,
    Fetching = 1,
    Processing = 2,
    /// Every source finished; workers drain what is left in the channel
    Draining = 3,
    Done = 4,
}

impl Stage {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Stage::Fetching,
            2 => Stage::Processing,
            3 => Stage::Draining,
            4 => Stage::Done,
            _ => Stage::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Fetching => "fetching",
            Stage::Processing => "processing",
            Stage::Draining => "draining",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named progress counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Items seen: raw links in fetch, stored records in tidy
    Total,
    /// Items fully handled, whatever the outcome
    Completed,
    /// Links that failed to decode
    Invalid,
    /// Items that failed validation
    Failed,
    /// Newly inserted records
    Created,
    /// Valid items whose endpoint was already stored
    Duplicate,
    /// Records that passed re-validation
    Succeeded,
    Removed,
    /// Records that have a country after enrichment
    CountrySet,
    /// Records still without a country
    CountryEmpty,
    SourcesDone,
}

const COUNTERS: usize = 11;

impl Counter {
    const fn index(self) -> usize {
        self as usize
    }
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub stage: Option<Stage>,
    pub total: u64,
    pub completed: u64,
    pub invalid: u64,
    pub failed: u64,
    pub created: u64,
    pub duplicate: u64,
    pub succeeded: u64,
    pub removed: u64,
    pub country_set: u64,
    pub country_empty: u64,
    pub sources_done: u64,
    pub sources_total: u64,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Completed over total, in `0.0..=1.0`
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed as f64 / self.total as f64).clamp(0.0, 1.0)
    }
}

/// Lock-free progress counters of one run
#[derive(Debug)]
pub struct Progress {
    stage: AtomicU8,
    counters: [AtomicU64; COUNTERS],
    sources_total: AtomicU64,
    finished_sources: Mutex<Vec<String>>,
    started: Instant,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress {
    pub fn new() -> Self {
        Self {
            stage: AtomicU8::new(Stage::Idle as u8),
            counters: Default::default(),
            sources_total: AtomicU64::new(0),
            finished_sources: Mutex::new(Vec::new()),
            started: Instant::now(),
        }
    }

    pub fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::Acquire))
    }

    pub fn set_stage(&self, stage: Stage) {
        self.stage.store(stage as u8, Ordering::Release);
    }

    /// Move to `to` only if the run is still in `from`
    pub fn advance(&self, from: Stage, to: Stage) -> bool {
        self.stage
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    pub fn set_sources_total(&self, n: usize) {
        self.sources_total.store(n as u64, Ordering::Relaxed);
    }

    pub fn source_done(&self, name: &str) {
        if let Ok(mut finished) = self.finished_sources.lock() {
            finished.push(name.to_string());
        }
        self.incr(Counter::SourcesDone);
    }

    /// Names of sources that finished, in completion order
    pub fn finished_sources(&self) -> Vec<String> {
        self.finished_sources
            .lock()
            .map(|finished| finished.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            stage: Some(self.stage()),
            total: self.get(Counter::Total),
            completed: self.get(Counter::Completed),
            invalid: self.get(Counter::Invalid),
            failed: self.get(Counter::Failed),
            created: self.get(Counter::Created),
            duplicate: self.get(Counter::Duplicate),
            succeeded: self.get(Counter::Succeeded),
            removed: self.get(Counter::Removed),
            country_set: self.get(Counter::CountrySet),
            country_empty: self.get(Counter::CountryEmpty),
            sources_done: self.get(Counter::SourcesDone),
            sources_total: self.sources_total.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_start_at_zero() {
        let progress = Progress::new();
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.stage, Some(Stage::Idle));
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.ratio(), 0.0);
    }

    #[test]
    fn test_stage_transitions() {
        let progress = Progress::new();
        progress.set_stage(Stage::Fetching);
        assert!(progress.advance(Stage::Fetching, Stage::Draining));
        assert!(!progress.advance(Stage::Fetching, Stage::Processing));
        assert_eq!(progress.stage(), Stage::Draining);
    }

    #[test]
    fn test_concurrent_increments() {
        let progress = Arc::new(Progress::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let progress = Arc::clone(&progress);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        progress.incr(Counter::Total);
                        progress.incr(Counter::Completed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.total, 8000);
        assert_eq!(snapshot.completed, 8000);
        assert_eq!(snapshot.ratio(), 1.0);
    }

    #[test]
    fn test_sources_done() {
        let progress = Progress::new();
        progress.set_sources_total(2);
        progress.source_done("a");
        progress.source_done("b");

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.sources_done, 2);
        assert_eq!(snapshot.sources_total, 2);
        assert_eq!(progress.finished_sources(), vec!["a", "b"]);
    }
}
