//! The submission worker pool: send `PENDING` documents to OCR.

use std::sync::Arc;

use super::{PassSummary, PoolSettings, RecordOutcome, boxed, run_pool_pass};
use crate::{
    jobs::{JobFilter, JobRecord, JobStatus, JobStore, Transition},
    ocr::OcrService,
    prelude::*,
};

/// Submits pending records to the OCR service.
#[derive(Clone)]
pub struct SubmitPool {
    store: Arc<dyn JobStore>,
    ocr: Arc<dyn OcrService>,
    settings: PoolSettings,
}

impl SubmitPool {
    /// Create a new pool.
    pub fn new(store: Arc<dyn JobStore>, ocr: Arc<dyn OcrService>, settings: PoolSettings) -> Self {
        Self {
            store,
            ocr,
            settings,
        }
    }

    /// Make one full scan over `PENDING` records, submitting each one.
    #[instrument(level = "debug", skip_all)]
    pub async fn run_pass(&self) -> Result<PassSummary> {
        let store = self.store.clone();
        let ocr = self.ocr.clone();
        run_pool_pass(
            self.store.clone(),
            JobFilter::Status(JobStatus::Pending),
            self.settings,
            move |record| boxed(submit_one(store.clone(), ocr.clone(), record)),
        )
        .await
    }

    /// Run passes until a full scan finds nothing pending.
    pub async fn run_until_drained(&self) -> Result<PassSummary> {
        let mut total = PassSummary::default();
        loop {
            let summary = self.run_pass().await?;
            info!("Submission pass: {summary}");
            if summary.seen == 0 {
                return Ok(total);
            }
            total += summary;
        }
    }
}

/// Submit a single record, and record the result.
///
/// OCR failures of any kind, including timeouts, become `FAILED_SUBMIT`. Only
/// job store failures are returned as errors.
#[instrument(level = "debug", skip_all, fields(id = %record.document_id))]
async fn submit_one(
    store: Arc<dyn JobStore>,
    ocr: Arc<dyn OcrService>,
    record: JobRecord,
) -> Result<RecordOutcome> {
    let (transition, outcome) = match ocr.submit(&record.document_id, &record.source).await {
        Ok(job_handle) => {
            debug!(%job_handle, "Submitted to OCR");
            (Transition::Submitted { job_handle }, RecordOutcome::Submitted)
        }
        Err(err) => {
            warn!(source = %record.source, "Submission failed: {err}");
            (
                Transition::SubmitFailed {
                    error: err.to_string(),
                },
                RecordOutcome::Failed,
            )
        }
    };
    let update = store
        .conditional_update(&record.document_id, JobStatus::Pending, transition)
        .await
        .with_context(|| format!("failed to update {}", record.document_id))?;
    if update.is_applied() {
        Ok(outcome)
    } else {
        debug!(?update, "Record already left PENDING");
        Ok(RecordOutcome::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::{
        blob::BlobLocation,
        jobs::memory::MemoryJobStore,
        ocr::{TimedOcrService, fake::FakeOcrService},
        pipeline::discovery::register_documents,
    };

    const SETTINGS: PoolSettings = PoolSettings {
        batch_size: 2,
        workers: 3,
    };

    async fn store_with(keys: &[&str]) -> Arc<MemoryJobStore> {
        let store = Arc::new(MemoryJobStore::new());
        let sources = keys
            .iter()
            .map(|key| BlobLocation::new("scans", *key))
            .collect();
        register_documents(store.as_ref(), sources).await.unwrap();
        store
    }

    fn status_of(store: &MemoryJobStore, key: &str) -> JobRecord {
        let id = JobRecord::new_pending(BlobLocation::new("scans", key), Utc::now()).document_id;
        store
            .snapshot()
            .into_iter()
            .find(|r| r.document_id == id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_submits_every_pending_record() {
        let store = store_with(&["a.pdf", "b.pdf", "c.pdf", "d.pdf", "e.pdf"]).await;
        let fake = Arc::new(FakeOcrService::default());
        let pool = SubmitPool::new(store.clone(), fake.clone(), SETTINGS);

        let summary = pool.run_until_drained().await.unwrap();
        assert_eq!(summary.submitted, 5);
        assert_eq!(fake.submissions().len(), 5);
        for record in store.snapshot() {
            assert_eq!(record.status, JobStatus::Submitted);
            assert!(record.ocr_job_handle.is_some());
        }

        // Nothing left, so a second pass does nothing.
        let again = pool.run_pass().await.unwrap();
        assert_eq!(again.seen, 0);
        assert_eq!(fake.submissions().len(), 5);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let store = store_with(&["bad.pdf", "good.pdf"]).await;
        let fake = Arc::new(FakeOcrService::default());
        fake.reject("bad.pdf");
        let pool = SubmitPool::new(store.clone(), fake, SETTINGS);

        let summary = pool.run_until_drained().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.submitted, 1);

        let bad = status_of(&store, "bad.pdf");
        assert_eq!(bad.status, JobStatus::FailedSubmit);
        assert!(bad.last_error.unwrap().contains("unsupported document"));
        assert_eq!(status_of(&store, "good.pdf").status, JobStatus::Submitted);
    }

    #[tokio::test]
    async fn test_submit_timeout_fails_record() {
        let store = store_with(&["slow.pdf"]).await;
        let fake = Arc::new(FakeOcrService::default());
        fake.hang_on_submit("slow.pdf");
        let ocr = Arc::new(TimedOcrService::new(fake, Duration::from_millis(20)));
        let pool = SubmitPool::new(store.clone(), ocr, SETTINGS);

        pool.run_pass().await.unwrap();
        let record = status_of(&store, "slow.pdf");
        assert_eq!(record.status, JobStatus::FailedSubmit);
        assert!(record.ocr_job_handle.is_none());

        // And it no longer shows up as pending.
        let next = pool.run_pass().await.unwrap();
        assert_eq!(next.seen, 0);
    }
}
