//! An in-process [`JobStore`], for tests and single-process runs.

use std::{collections::BTreeMap, ops::Bound, sync::Mutex};

use super::{
    record::{DocumentId, JobRecord, JobStatus, Transition},
    store::{JobFilter, JobStore, ScanCursor, ScanPage, UpdateOutcome, apply_if_expected},
};
use crate::{errors::StoreError, prelude::*};

/// A job table held in memory. Records are kept in id order, so scans page
/// through them deterministically.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: Mutex<BTreeMap<DocumentId, JobRecord>>,
}

impl MemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out every record.
    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<JobRecord> {
        let records = self.records.lock().expect("lock poisoned");
        records.values().cloned().collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, document_id: &DocumentId) -> Result<Option<JobRecord>, StoreError> {
        let records = self.records.lock().expect("lock poisoned");
        Ok(records.get(document_id).cloned())
    }

    async fn upsert_if_absent(&self, record: JobRecord) -> Result<bool, StoreError> {
        let mut records = self.records.lock().expect("lock poisoned");
        if records.contains_key(&record.document_id) {
            return Ok(false);
        }
        records.insert(record.document_id.clone(), record);
        Ok(true)
    }

    async fn conditional_update(
        &self,
        document_id: &DocumentId,
        expected: JobStatus,
        transition: Transition,
    ) -> Result<UpdateOutcome, StoreError> {
        // Hold the lock across the check and the write, so the update is
        // atomic with respect to other workers.
        let mut records = self.records.lock().expect("lock poisoned");
        match records.get_mut(document_id) {
            Some(record) => {
                // Work on a copy so a rejected transition leaves no trace.
                let mut updated = record.clone();
                let outcome = apply_if_expected(&mut updated, expected, transition)?;
                if outcome.is_applied() {
                    *record = updated;
                }
                Ok(outcome)
            }
            None => Ok(UpdateOutcome::Skipped { current: None }),
        }
    }

    async fn scan(
        &self,
        filter: JobFilter,
        page_size: usize,
        after: Option<ScanCursor>,
    ) -> Result<ScanPage, StoreError> {
        if page_size == 0 {
            return Err(StoreError::Rejected("page size must be positive".to_owned()));
        }
        let records = self.records.lock().expect("lock poisoned");
        let lower = match &after {
            Some(ScanCursor(id)) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        let mut page = Vec::with_capacity(page_size);
        let mut last_seen = None;
        for (id, record) in records.range::<DocumentId, _>((lower, Bound::Unbounded)) {
            if page.len() == page_size {
                break;
            }
            last_seen = Some(id);
            if filter.matches(record) {
                page.push(record.clone());
            }
        }
        // Like a real table, only report "finished" once we've run off the
        // end.
        let finished = match last_seen {
            Some(id) => records
                .range::<DocumentId, _>((Bound::Excluded(id), Bound::Unbounded))
                .next()
                .is_none(),
            None => true,
        };
        Ok(ScanPage {
            records: page,
            next: if finished {
                None
            } else {
                last_seen.cloned().map(ScanCursor)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        blob::BlobLocation,
        jobs::store::{reset_failed, scan_pages},
    };
    use futures::TryStreamExt as _;
    use std::sync::Arc;

    fn record(key: &str) -> JobRecord {
        JobRecord::new_pending(BlobLocation::new("scans", key), Utc::now())
    }

    #[tokio::test]
    async fn test_upsert_if_absent_never_clobbers() {
        let store = MemoryJobStore::new();
        assert!(store.upsert_if_absent(record("a.pdf")).await.unwrap());
        let id = record("a.pdf").document_id;
        store
            .conditional_update(
                &id,
                JobStatus::Pending,
                Transition::Submitted {
                    job_handle: "h".to_owned(),
                },
            )
            .await
            .unwrap();
        assert!(!store.upsert_if_absent(record("a.pdf")).await.unwrap());
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Submitted);
    }

    #[tokio::test]
    async fn test_conditional_update_is_idempotent() {
        let store = MemoryJobStore::new();
        let r = record("a.pdf");
        let id = r.document_id.clone();
        store.upsert_if_absent(r).await.unwrap();
        let transition = Transition::Submitted {
            job_handle: "h1".to_owned(),
        };
        let first = store
            .conditional_update(&id, JobStatus::Pending, transition.clone())
            .await
            .unwrap();
        assert!(first.is_applied());
        let second = store
            .conditional_update(&id, JobStatus::Pending, transition)
            .await
            .unwrap();
        assert_eq!(
            second,
            UpdateOutcome::Skipped {
                current: Some(JobStatus::Submitted)
            }
        );
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.ocr_job_handle.as_deref(), Some("h1"));
    }

    #[tokio::test]
    async fn test_update_of_missing_record_is_skipped() {
        let store = MemoryJobStore::new();
        let outcome = store
            .conditional_update(
                &DocumentId::new("scans/ghost.pdf"),
                JobStatus::Pending,
                Transition::Reset,
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Skipped { current: None });
    }

    #[tokio::test]
    async fn test_invalid_transition_is_an_error() {
        let store = MemoryJobStore::new();
        let r = record("a.pdf");
        let id = r.document_id.clone();
        store.upsert_if_absent(r).await.unwrap();
        let result = store
            .conditional_update(&id, JobStatus::Pending, Transition::Reset)
            .await;
        assert!(matches!(result, Err(StoreError::InvalidTransition(_))));
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_scan_pages_through_matches() {
        let store = Arc::new(MemoryJobStore::new());
        for i in 0..7 {
            store
                .upsert_if_absent(record(&format!("doc{i}.pdf")))
                .await
                .unwrap();
        }
        let id = record("doc3.pdf").document_id;
        store
            .conditional_update(
                &id,
                JobStatus::Pending,
                Transition::SubmitFailed {
                    error: "nope".to_owned(),
                },
            )
            .await
            .unwrap();

        let pages: Vec<Vec<JobRecord>> =
            scan_pages(store.clone(), JobFilter::Status(JobStatus::Pending), 2)
                .try_collect()
                .await
                .unwrap();
        assert!(pages.iter().all(|page| page.len() <= 2));
        let ids: Vec<_> = pages
            .into_iter()
            .flatten()
            .map(|r| r.document_id.to_string())
            .collect();
        assert_eq!(ids.len(), 6);
        assert!(!ids.contains(&"scans/doc3.pdf".to_owned()));
    }

    #[tokio::test]
    async fn test_reset_failed() {
        let store = MemoryJobStore::new();
        let r = record("a.pdf");
        let id = r.document_id.clone();
        store.upsert_if_absent(r).await.unwrap();

        // Not failed, so nothing to do.
        let outcome = reset_failed(&store, &id).await.unwrap();
        assert!(!outcome.is_applied());

        store
            .conditional_update(
                &id,
                JobStatus::Pending,
                Transition::SubmitFailed {
                    error: "timeout".to_owned(),
                },
            )
            .await
            .unwrap();
        let outcome = reset_failed(&store, &id).await.unwrap();
        assert!(outcome.is_applied());
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }
}
