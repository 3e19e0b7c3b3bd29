//! The loop that drives discovery, submission and completion.

use std::{sync::Arc, time::Duration};

use tokio::time;

use super::{
    PassSummary, complete::CompletePool, discovery::discover_jobs, submit::SubmitPool,
};
use crate::{
    blob::{BlobPrefix, BlobStore},
    jobs::JobStore,
    prelude::*,
};

/// Totals across every iteration of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// How many times we went round the loop.
    pub iterations: usize,
    /// New records created by discovery.
    pub registered: usize,
    /// Submission totals.
    pub submit: PassSummary,
    /// Completion totals. `not_ready` is counted once per poll.
    pub complete: PassSummary,
    /// Did we stop because there was no more work?
    pub drained: bool,
}

/// Drives the pipeline until there's nothing left to do.
pub struct Orchestrator {
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) submit: SubmitPool,
    pub(crate) complete: CompletePool,

    /// Where to look for new documents. `None` skips discovery.
    pub(crate) source: Option<BlobPrefix>,

    /// How long to wait between iterations when OCR jobs are still running.
    pub(crate) poll_interval: Duration,

    /// Stop after this many iterations even if work remains.
    pub(crate) max_iterations: Option<usize>,
}

impl Orchestrator {
    /// Run until every discovered document has left `PENDING` and `SUBMITTED`,
    /// or until we hit `max_iterations`.
    #[instrument(level = "debug", skip_all)]
    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        loop {
            summary.iterations += 1;
            if let Some(source) = &self.source {
                let report = discover_jobs(self.blobs.as_ref(), self.store.as_ref(), source).await?;
                summary.registered += report.registered;
            }
            summary.submit += self.submit.run_until_drained().await?;
            let completed = self.complete.run_pass().await?;
            summary.complete += completed;

            // Every record we saw either finished or failed, and submission
            // already drained PENDING, so there's nothing left in flight.
            if completed.not_ready == 0 && completed.skipped == 0 {
                summary.drained = true;
                info!(iterations = summary.iterations, "All documents processed");
                return Ok(summary);
            }
            if self
                .max_iterations
                .is_some_and(|max| summary.iterations >= max)
            {
                warn!(
                    still_running = completed.not_ready,
                    "Stopping after {} iterations", summary.iterations
                );
                return Ok(summary);
            }
            debug!(
                waiting = completed.not_ready,
                "Waiting {:?} for OCR jobs", self.poll_interval
            );
            time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blob::{BlobLocation, fs::FsBlobStore},
        jobs::{JobStatus, memory::MemoryJobStore},
        ocr::{
            PollOutcome,
            fake::{FakeOcrService, handle_for, payload_with_lines},
        },
        pipeline::PoolSettings,
    };

    const SETTINGS: PoolSettings = PoolSettings {
        batch_size: 10,
        workers: 2,
    };

    async fn orchestrator(
        dir: &tempfile::TempDir,
        fake: Arc<FakeOcrService>,
        max_iterations: Option<usize>,
    ) -> (Orchestrator, Arc<MemoryJobStore>) {
        let blobs = Arc::new(FsBlobStore::new(dir.path()));
        for key in ["in/a.pdf", "in/b.pdf"] {
            blobs
                .write(&BlobLocation::new("scans", key), b"%PDF".to_vec())
                .await
                .unwrap();
        }
        let store = Arc::new(MemoryJobStore::new());
        let orchestrator = Orchestrator {
            blobs: blobs.clone(),
            store: store.clone(),
            submit: SubmitPool::new(store.clone(), fake.clone(), SETTINGS),
            complete: CompletePool::new(
                store.clone(),
                blobs,
                fake,
                BlobPrefix::new("out", ""),
                SETTINGS,
            ),
            source: Some(BlobPrefix::new("scans", "in")),
            poll_interval: Duration::from_millis(1),
            max_iterations,
        };
        (orchestrator, store)
    }

    #[tokio::test]
    async fn test_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeOcrService::default());
        for key in ["in/a.pdf", "in/b.pdf"] {
            fake.finish(
                &handle_for(key),
                PollOutcome::Ready(payload_with_lines(&[key])),
            );
        }
        let (orchestrator, store) = orchestrator(&dir, fake, Some(5)).await;

        let summary = orchestrator.run().await.unwrap();
        assert!(summary.drained);
        assert_eq!(summary.iterations, 1);
        assert_eq!(summary.registered, 2);
        assert_eq!(summary.complete.completed, 2);
        assert!(
            store
                .snapshot()
                .iter()
                .all(|r| r.status == JobStatus::Complete)
        );
    }

    #[tokio::test]
    async fn test_stops_at_max_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeOcrService::default());
        let (orchestrator, store) = orchestrator(&dir, fake, Some(3)).await;

        let summary = orchestrator.run().await.unwrap();
        assert!(!summary.drained);
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.registered, 2);
        assert_eq!(summary.complete.not_ready, 6);
        assert!(
            store
                .snapshot()
                .iter()
                .all(|r| r.status == JobStatus::Submitted)
        );
    }
}
