//! Finding source documents and registering them as jobs.

use std::sync::Arc;

use chrono::Utc;
use futures::{StreamExt as _, TryStreamExt as _, stream};

use crate::{
    blob::{BlobLocation, BlobPrefix, BlobStore},
    errors::StoreError,
    jobs::{JobFilter, JobRecord, JobStatus, JobStore, reset_failed, scan_pages},
    prelude::*,
};

/// How many store writes discovery keeps in flight.
const DISCOVERY_CONCURRENCY: usize = 16;

/// What a discovery run found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Source documents listed.
    pub found: usize,
    /// New records created. The rest already existed.
    pub registered: usize,
}

/// Create a `PENDING` record for each source that doesn't have one yet.
///
/// Existing records are never touched, whatever their status, so this is safe
/// to run as often as we like.
pub async fn register_documents(
    store: &dyn JobStore,
    sources: Vec<BlobLocation>,
) -> Result<DiscoveryReport, StoreError> {
    let found = sources.len();
    let now = Utc::now();
    let inserted = stream::iter(sources)
        .map(|source| store.upsert_if_absent(JobRecord::new_pending(source, now)))
        .buffer_unordered(DISCOVERY_CONCURRENCY)
        .try_fold(0, |count, inserted| async move {
            Ok(count + usize::from(inserted))
        })
        .await?;
    Ok(DiscoveryReport {
        found,
        registered: inserted,
    })
}

/// List the documents under `source` and register them.
#[instrument(level = "debug", skip(blobs, store), fields(source = %source))]
pub async fn discover_jobs(
    blobs: &dyn BlobStore,
    store: &dyn JobStore,
    source: &BlobPrefix,
) -> Result<DiscoveryReport> {
    let sources = blobs
        .list(source)
        .await
        .with_context(|| format!("failed to list source documents under {source}"))?;
    let report = register_documents(store, sources)
        .await
        .context("failed to register source documents")?;
    info!(
        found = report.found,
        registered = report.registered,
        "Discovered source documents"
    );
    Ok(report)
}

/// Reset every failed record back to `PENDING`. Returns how many we reset.
#[instrument(level = "debug", skip(store))]
pub async fn reset_all_failed(store: Arc<dyn JobStore>, page_size: usize) -> Result<usize> {
    let mut reset = 0;
    for status in [JobStatus::FailedSubmit, JobStatus::FailedConvert] {
        // Collect first, so we aren't resetting records out from under our
        // own scan.
        let records = scan_pages(store.clone(), JobFilter::Status(status), page_size)
            .try_concat()
            .await
            .with_context(|| format!("failed to scan for {status} records"))?;
        for record in records {
            let outcome = reset_failed(store.as_ref(), &record.document_id)
                .await
                .with_context(|| format!("failed to reset {}", record.document_id))?;
            if outcome.is_applied() {
                debug!(id = %record.document_id, from = %status, "Reset failed record");
                reset += 1;
            }
        }
    }
    Ok(reset)
}
