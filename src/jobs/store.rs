//! The job store interface.
//!
//! The store is the single source of truth for every record's status. All
//! status changes go through [`JobStore::conditional_update`], which is a no-op
//! unless the record is still in the status the caller expects. This is what
//! makes two workers racing on the same record harmless.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::{StreamExt as _, stream};

use super::record::{DocumentId, JobRecord, JobStatus, Transition};
use crate::{
    async_utils::BoxedStream,
    errors::StoreError,
    prelude::*,
    retry::{with_backoff, with_timeout},
};

/// Which records a scan should return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobFilter {
    /// Every record.
    All,
    /// Records with exactly this status.
    Status(JobStatus),
    /// Submitted records with no output text yet.
    AwaitingOutput,
}

impl JobFilter {
    /// Does `record` match?
    pub fn matches(&self, record: &JobRecord) -> bool {
        match self {
            JobFilter::All => true,
            JobFilter::Status(status) => record.status == *status,
            JobFilter::AwaitingOutput => {
                record.status == JobStatus::Submitted && record.output_text_location.is_none()
            }
        }
    }
}

/// Where to resume a scan: just after this document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanCursor(pub DocumentId);

/// One page of scan results.
#[derive(Clone, Debug, Default)]
pub struct ScanPage {
    /// At most `page_size` matching records.
    pub records: Vec<JobRecord>,

    /// Where to continue, or `None` if the scan is finished.
    pub next: Option<ScanCursor>,
}

/// What [`JobStore::conditional_update`] did.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOutcome {
    /// The record was updated. Holds the new record.
    Applied(JobRecord),

    /// The record was not in the expected status (or does not exist), so we
    /// left it alone. Holds the status we saw, if we know it.
    Skipped { current: Option<JobStatus> },
}

impl UpdateOutcome {
    /// Was the update applied?
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }
}

/// Interface to a job table.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Look up a single record.
    async fn get(&self, document_id: &DocumentId) -> Result<Option<JobRecord>, StoreError>;

    /// Insert `record` unless a record with the same id exists. Returns `true`
    /// if we inserted it.
    async fn upsert_if_absent(&self, record: JobRecord) -> Result<bool, StoreError>;

    /// Apply `transition` if, and only if, the record currently has status
    /// `expected`. Anything else is a no-op reported as
    /// [`UpdateOutcome::Skipped`], not an error.
    async fn conditional_update(
        &self,
        document_id: &DocumentId,
        expected: JobStatus,
        transition: Transition,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Return up to `page_size` records matching `filter`, starting after
    /// `after`.
    async fn scan(
        &self,
        filter: JobFilter,
        page_size: usize,
        after: Option<ScanCursor>,
    ) -> Result<ScanPage, StoreError>;
}

/// Helper for store implementations: validate and apply `transition` to a
/// record we've already loaded.
pub(crate) fn apply_if_expected(
    record: &mut JobRecord,
    expected: JobStatus,
    transition: Transition,
) -> Result<UpdateOutcome, StoreError> {
    if record.status != expected {
        return Ok(UpdateOutcome::Skipped {
            current: Some(record.status),
        });
    }
    record.apply(transition, Utc::now())?;
    Ok(UpdateOutcome::Applied(record.clone()))
}

/// Stream every record matching `filter`, one page at a time.
pub fn scan_pages(
    store: Arc<dyn JobStore>,
    filter: JobFilter,
    page_size: usize,
) -> BoxedStream<Result<Vec<JobRecord>, StoreError>> {
    // `None` means "finished"; `Some(cursor)` means "fetch the page after
    // `cursor`", where `Some(None)` is the first page.
    stream::unfold(Some(None), move |state: Option<Option<ScanCursor>>| {
        let store = store.clone();
        async move {
            let after = state?;
            match store.scan(filter, page_size, after).await {
                Ok(ScanPage { records, next }) => {
                    let state = next.map(Some);
                    Some((Ok(records), state))
                }
                Err(err) => Some((Err(err), None)),
            }
        }
    })
    // Stores may return empty pages in the middle of a scan.
    .filter(|page| futures::future::ready(!matches!(page, Ok(records) if records.is_empty())))
    .boxed()
}

/// Move a failed record back to `PENDING` so the pipeline will try it again.
///
/// Records which are not in a failed state are left alone.
#[instrument(level = "debug", skip(store))]
pub async fn reset_failed(
    store: &dyn JobStore,
    document_id: &DocumentId,
) -> Result<UpdateOutcome, StoreError> {
    let Some(record) = store.get(document_id).await? else {
        return Ok(UpdateOutcome::Skipped { current: None });
    };
    if !record.status.is_failed() {
        return Ok(UpdateOutcome::Skipped {
            current: Some(record.status),
        });
    }
    store
        .conditional_update(document_id, record.status, Transition::Reset)
        .await
}

/// Wraps another [`JobStore`], applying a timeout to each call and retrying
/// transient failures with backoff.
pub struct ResilientJobStore {
    inner: Arc<dyn JobStore>,
    call_timeout: Duration,
}

impl ResilientJobStore {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn JobStore>, call_timeout: Duration) -> Self {
        Self {
            inner,
            call_timeout,
        }
    }
}

#[async_trait]
impl JobStore for ResilientJobStore {
    async fn get(&self, document_id: &DocumentId) -> Result<Option<JobRecord>, StoreError> {
        with_backoff("job store get", || {
            with_timeout(self.call_timeout, self.inner.get(document_id))
        })
        .await
    }

    async fn upsert_if_absent(&self, record: JobRecord) -> Result<bool, StoreError> {
        with_backoff("job store insert", || {
            with_timeout(self.call_timeout, self.inner.upsert_if_absent(record.clone()))
        })
        .await
    }

    async fn conditional_update(
        &self,
        document_id: &DocumentId,
        expected: JobStatus,
        transition: Transition,
    ) -> Result<UpdateOutcome, StoreError> {
        // Retrying is safe: if an earlier attempt landed but we lost the
        // response, the retry sees the new status and skips.
        with_backoff("job store update", || {
            with_timeout(
                self.call_timeout,
                self.inner
                    .conditional_update(document_id, expected, transition.clone()),
            )
        })
        .await
    }

    async fn scan(
        &self,
        filter: JobFilter,
        page_size: usize,
        after: Option<ScanCursor>,
    ) -> Result<ScanPage, StoreError> {
        with_backoff("job store scan", || {
            with_timeout(
                self.call_timeout,
                self.inner.scan(filter, page_size, after.clone()),
            )
        })
        .await
    }
}
