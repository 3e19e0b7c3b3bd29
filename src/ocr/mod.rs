//! The asynchronous OCR service.
//!
//! We treat the service as an opaque job API: submit a document and get a
//! handle back, then fetch the handle's results, one page at a time, until the
//! job finishes.

use std::{sync::Arc, time::Duration};

use leaky_bucket::RateLimiter;
use serde_json::Value;
use tokio::time;

use crate::{
    blob::BlobLocation,
    errors::{RecognitionFailure, SubmissionError},
    jobs::DocumentId,
    layout::RecognitionPayload,
    prelude::*,
    retry::with_timeout,
};

#[cfg(test)]
pub mod fake;
pub mod textract;

/// What we learned by polling a job.
#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome {
    /// Still running. Poll again later.
    NotReady,
    /// Finished, with this result.
    Ready(RecognitionPayload),
    /// The job itself failed. Polling again won't help.
    Failed(RecognitionFailure),
}

/// One page of results from a finished job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultPage {
    /// Blocks, in the service's own JSON form.
    pub blocks: Vec<Value>,
    /// Document-level metadata, if the service reports any.
    pub document_metadata: Option<Value>,
    /// Pass this back to fetch the following page.
    pub next_token: Option<String>,
}

/// What we got from a single call for a job's results.
#[derive(Clone, Debug, PartialEq)]
pub enum FetchOutcome {
    /// The job is still running, or the service couldn't answer right now.
    NotReady,
    /// The job has finished, and here is one page of its results.
    Page(ResultPage),
    /// The job failed.
    Failed(RecognitionFailure),
}

/// Interface to an OCR service.
#[async_trait]
pub trait OcrService: Send + Sync + 'static {
    /// Start recognizing the document at `source`. Returns an opaque job
    /// handle.
    ///
    /// Submitting the same `document_id` twice should return the same handle
    /// where the service supports it.
    async fn submit(
        &self,
        document_id: &DocumentId,
        source: &BlobLocation,
    ) -> Result<String, SubmissionError>;

    /// Fetch one page of a job's results with a single service call.
    /// `next_token` is `None` for the first page.
    ///
    /// Errors talking to the service should be reported as
    /// [`FetchOutcome::NotReady`] if they might go away, so that we poll again
    /// on the next pass.
    async fn fetch_results(&self, job_handle: &str, next_token: Option<String>)
    -> FetchOutcome;

    /// Check on a job, gathering every page of its results once it's done.
    async fn poll(&self, job_handle: &str) -> PollOutcome {
        let mut blocks = Vec::new();
        let mut document_metadata = None;
        let mut next_token = None;
        let mut pages = 0usize;
        loop {
            match self.fetch_results(job_handle, next_token.take()).await {
                FetchOutcome::NotReady => {
                    if pages > 0 {
                        warn!(
                            job_handle,
                            pages, "Could not fetch all results, will try again later"
                        );
                    }
                    return PollOutcome::NotReady;
                }
                FetchOutcome::Failed(failure) => return PollOutcome::Failed(failure),
                FetchOutcome::Page(page) => {
                    pages += 1;
                    blocks.extend(page.blocks);
                    if document_metadata.is_none() {
                        document_metadata = page.document_metadata;
                    }
                    match page.next_token {
                        Some(token) => next_token = Some(token),
                        None => break,
                    }
                }
            }
        }
        debug!(job_handle, pages, blocks = blocks.len(), "Fetched OCR results");
        match RecognitionPayload::from_service_blocks(document_metadata, blocks) {
            Ok(payload) => PollOutcome::Ready(payload),
            Err(err) => PollOutcome::Failed(RecognitionFailure {
                job_handle: job_handle.to_owned(),
                reason: err.to_string(),
            }),
        }
    }
}

/// Wraps another [`OcrService`] and puts a time limit on each service call.
///
/// A submission that times out fails like any other. A results call that
/// times out just means "not ready yet". Collecting a large result may take
/// many calls, and only each single call is limited.
pub struct TimedOcrService {
    inner: Arc<dyn OcrService>,
    call_timeout: Duration,
}

impl TimedOcrService {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn OcrService>, call_timeout: Duration) -> Self {
        Self {
            inner,
            call_timeout,
        }
    }
}

#[async_trait]
impl OcrService for TimedOcrService {
    async fn submit(
        &self,
        document_id: &DocumentId,
        source: &BlobLocation,
    ) -> Result<String, SubmissionError> {
        with_timeout(self.call_timeout, self.inner.submit(document_id, source)).await
    }

    async fn fetch_results(
        &self,
        job_handle: &str,
        next_token: Option<String>,
    ) -> FetchOutcome {
        match time::timeout(
            self.call_timeout,
            self.inner.fetch_results(job_handle, next_token),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(job_handle, "Results call timed out, will try again later");
                FetchOutcome::NotReady
            }
        }
    }
}

/// Wraps another [`OcrService`] and makes every call wait its turn on a shared
/// rate limiter. Time spent waiting is not part of any call's timeout.
pub struct RateLimitedOcrService {
    inner: Arc<dyn OcrService>,
    limiter: RateLimiter,
}

impl RateLimitedOcrService {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn OcrService>, limiter: RateLimiter) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl OcrService for RateLimitedOcrService {
    async fn submit(
        &self,
        document_id: &DocumentId,
        source: &BlobLocation,
    ) -> Result<String, SubmissionError> {
        self.limiter.acquire_one().await;
        self.inner.submit(document_id, source).await
    }

    async fn fetch_results(
        &self,
        job_handle: &str,
        next_token: Option<String>,
    ) -> FetchOutcome {
        self.limiter.acquire_one().await;
        self.inner.fetch_results(job_handle, next_token).await
    }
}
