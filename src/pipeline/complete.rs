//! The completion worker pool: collect OCR results and write text artifacts.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;

use super::{PassSummary, PoolSettings, RecordOutcome, boxed, run_pool_pass};
use crate::{
    blob::{BlobLocation, BlobPrefix, BlobStore},
    errors::MalformedPayloadError,
    jobs::{JobFilter, JobRecord, JobStatus, JobStore, Transition},
    layout::{DocumentMetrics, RecognitionPayload, reconstruct_document},
    ocr::{OcrService, PollOutcome},
    prelude::*,
};

/// The longest document name we'll put in an artifact key.
const MAX_NAME_LEN: usize = 80;

/// Characters we strip from document names before using them in keys.
static UNSAFE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("failed to compile regex"));

/// Where a document's artifacts go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactLocations {
    /// The reconstructed text.
    pub text: BlobLocation,
    /// The document metrics, as JSON.
    pub metrics: BlobLocation,
    /// The OCR service's result, as JSON.
    pub payload: BlobLocation,
}

impl ArtifactLocations {
    /// Pick fresh artifact keys for `record`. The keys include the time, so a
    /// retried document never overwrites an earlier artifact.
    pub fn new(output: &BlobPrefix, record: &JobRecord, now: DateTime<Utc>) -> Self {
        let name = UNSAFE_NAME_CHARS
            .replace_all(record.source.file_stem(), "")
            .chars()
            .take(MAX_NAME_LEN)
            .collect::<String>();
        // Two sources can share a file name, so add a short id-derived tag.
        let token = record.document_id.request_token();
        let tag = &token[..8];
        let base = format!("{}_{name}_{tag}", now.format("%Y%m%dT%H%M%SZ"));
        Self {
            text: output.join(&format!("{base}_txt.txt")),
            metrics: output.join(&format!("{base}_metrics.json")),
            payload: output.join(&format!("{base}_textract.json")),
        }
    }
}

/// Text and metrics for one document.
#[derive(Debug)]
struct Converted {
    text: String,
    metrics: DocumentMetrics,
}

/// Run the (CPU-bound) reconstruction and metrics.
fn convert(payload: &RecognitionPayload) -> Result<Converted, MalformedPayloadError> {
    let document = reconstruct_document(payload)?;
    Ok(Converted {
        text: document.text,
        metrics: DocumentMetrics::for_payload(payload),
    })
}

/// Polls submitted records, and converts finished ones.
#[derive(Clone)]
pub struct CompletePool {
    store: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    ocr: Arc<dyn OcrService>,
    output: BlobPrefix,
    settings: PoolSettings,
}

impl CompletePool {
    /// Create a new pool, writing artifacts under `output`.
    pub fn new(
        store: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        ocr: Arc<dyn OcrService>,
        output: BlobPrefix,
        settings: PoolSettings,
    ) -> Self {
        Self {
            store,
            blobs,
            ocr,
            output,
            settings,
        }
    }

    /// Make one full scan over submitted records without output. Records which
    /// aren't ready yet are left for the next pass.
    #[instrument(level = "debug", skip_all)]
    pub async fn run_pass(&self) -> Result<PassSummary> {
        let pool = self.clone();
        let summary = run_pool_pass(
            self.store.clone(),
            JobFilter::AwaitingOutput,
            self.settings,
            move |record| {
                let pool = pool.clone();
                boxed(async move { pool.complete_one(record).await })
            },
        )
        .await?;
        info!("Completion pass: {summary}");
        Ok(summary)
    }

    /// Poll a single record, and convert it if it's ready.
    #[instrument(level = "debug", skip_all, fields(id = %record.document_id))]
    async fn complete_one(&self, record: JobRecord) -> Result<RecordOutcome> {
        let Some(job_handle) = record.ocr_job_handle.as_deref() else {
            return self
                .fail(&record, "submitted record has no job handle".to_owned())
                .await;
        };
        let payload = match self.ocr.poll(job_handle).await {
            PollOutcome::NotReady => {
                debug!(job_handle, "OCR not ready");
                return Ok(RecordOutcome::NotReady);
            }
            PollOutcome::Failed(failure) => {
                return self.fail(&record, failure.to_string()).await;
            }
            PollOutcome::Ready(payload) => payload,
        };

        let payload_json = payload.raw_json().to_vec();
        let converted =
            tokio::task::spawn_blocking(move || convert(&payload)).await;
        let converted = match converted {
            Ok(Ok(converted)) => converted,
            Ok(Err(err)) => return self.fail(&record, err.to_string()).await,
            Err(err) => {
                return self
                    .fail(&record, format!("conversion crashed: {err}"))
                    .await;
            }
        };
        info!(metrics = ?converted.metrics, "Converted document");

        // Write every artifact before touching the record, so a COMPLETE
        // record always points at text which exists.
        let artifacts = ArtifactLocations::new(&self.output, &record, Utc::now());
        self.blobs
            .write(&artifacts.payload, payload_json)
            .await
            .with_context(|| format!("failed to write {}", artifacts.payload))?;
        let metrics_json = serde_json::to_vec_pretty(&converted.metrics)
            .context("failed to serialize metrics")?;
        self.blobs
            .write(&artifacts.metrics, metrics_json)
            .await
            .with_context(|| format!("failed to write {}", artifacts.metrics))?;
        self.blobs
            .write(&artifacts.text, converted.text.into_bytes())
            .await
            .with_context(|| format!("failed to write {}", artifacts.text))?;

        self.update(
            &record,
            Transition::Completed {
                output: artifacts.text,
            },
            RecordOutcome::Completed,
        )
        .await
    }

    async fn fail(&self, record: &JobRecord, error: String) -> Result<RecordOutcome> {
        warn!(source = %record.source, "Conversion failed: {error}");
        self.update(record, Transition::ConvertFailed { error }, RecordOutcome::Failed)
            .await
    }

    async fn update(
        &self,
        record: &JobRecord,
        transition: Transition,
        outcome: RecordOutcome,
    ) -> Result<RecordOutcome> {
        let update = self
            .store
            .conditional_update(&record.document_id, JobStatus::Submitted, transition)
            .await
            .with_context(|| format!("failed to update {}", record.document_id))?;
        if update.is_applied() {
            Ok(outcome)
        } else {
            debug!(?update, "Record already left SUBMITTED");
            Ok(RecordOutcome::Skipped)
        }
    }
}
