//! The job pipeline: discovery, submission, completion, and the loop that
//! drives them.
//!
//! Each stage gets its store, blob and OCR handles at construction, so tests
//! can swap in fakes.

use std::{fmt, sync::Arc};

use futures::{FutureExt as _, TryStreamExt as _};

use crate::{
    async_utils::BoxedFuture,
    jobs::{JobFilter, JobRecord, JobStore, scan_pages},
    prelude::*,
    queues::work::{WorkFn, WorkQueue},
};

pub mod complete;
pub mod discovery;
pub mod orchestrator;
pub mod submit;

/// What happened to one record during a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Sent to OCR.
    Submitted,
    /// Text written and record marked complete.
    Completed,
    /// OCR is still working on it.
    NotReady,
    /// Moved to a failed status.
    Failed,
    /// Someone else moved the record first, so we left it alone.
    Skipped,
}

/// Counts for one pass of a worker pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Records returned by the scan.
    pub seen: usize,
    pub submitted: usize,
    pub completed: usize,
    pub not_ready: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl PassSummary {
    /// Count one record's outcome.
    pub fn record(&mut self, outcome: RecordOutcome) {
        self.seen += 1;
        match outcome {
            RecordOutcome::Submitted => self.submitted += 1,
            RecordOutcome::Completed => self.completed += 1,
            RecordOutcome::NotReady => self.not_ready += 1,
            RecordOutcome::Failed => self.failed += 1,
            RecordOutcome::Skipped => self.skipped += 1,
        }
    }
}

impl std::ops::AddAssign for PassSummary {
    fn add_assign(&mut self, other: Self) {
        self.seen += other.seen;
        self.submitted += other.submitted;
        self.completed += other.completed;
        self.not_ready += other.not_ready;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} seen, {} submitted, {} completed, {} not ready, {} failed, {} skipped",
            self.seen, self.submitted, self.completed, self.not_ready, self.failed, self.skipped
        )
    }
}

/// Batch and pool sizes for a worker pool.
#[derive(Clone, Copy, Debug)]
pub struct PoolSettings {
    /// Records fetched per scan page.
    pub batch_size: usize,
    /// Records processed at once.
    pub workers: usize,
}

/// Scan the store for records matching `filter`, a page at a time, and run
/// `work` on each record using a fixed pool of workers.
///
/// `work` returns an error only for infrastructure failures which survived
/// their retries. When that happens we let the rest of the page finish, then
/// fail the pass.
async fn run_pool_pass<F>(
    store: Arc<dyn JobStore>,
    filter: JobFilter,
    settings: PoolSettings,
    work: F,
) -> Result<PassSummary>
where
    F: Fn(JobRecord) -> BoxedFuture<Result<RecordOutcome>> + Send + Sync + 'static,
{
    let work_fn: WorkFn<JobRecord, RecordOutcome> = Arc::new(work);
    let queue = WorkQueue::new(settings.workers, work_fn);
    let handle = queue.handle();

    let mut summary = PassSummary::default();
    let mut pages = scan_pages(store, filter, settings.batch_size);
    let mut failure = None;
    while let Some(page) = pages.try_next().await.context("failed to scan job store")? {
        debug!(count = page.len(), ?filter, "Processing page of records");
        for result in handle.process_batch(page).await {
            match result {
                Ok(outcome) => summary.record(outcome),
                Err(err) => {
                    error!("Infrastructure failure: {err:?}");
                    failure.get_or_insert(err);
                }
            }
        }
        if failure.is_some() {
            break;
        }
    }

    drop(handle);
    queue.close().await?;
    match failure {
        Some(err) => Err(err.context(format!("pass over {filter:?} records failed"))),
        None => Ok(summary),
    }
}

/// Box up a per-record future for [`run_pool_pass`].
fn boxed<Fut>(future: Fut) -> BoxedFuture<Result<RecordOutcome>>
where
    Fut: Future<Output = Result<RecordOutcome>> + Send + 'static,
{
    future.boxed()
}
