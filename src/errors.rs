//! Error types for the pipeline.
//!
//! Application code mostly uses [`anyhow::Result`], but the worker pools need
//! to tell apart per-document failures (which become status transitions) from
//! infrastructure failures (which are retried, and which fail the whole pass
//! if retries run out). So the errors crossing those seams are typed.

use std::time::Duration;

use thiserror::Error;

use crate::{blob::BlobLocation, jobs::InvalidTransition, retry::IsKnownTransient};

/// The OCR service refused a document, or did not answer in time.
///
/// Always terminal for the current pass: the record becomes `FAILED_SUBMIT`.
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// The service rejected the request.
    #[error("OCR service rejected submission: {0}")]
    Rejected(String),

    /// The service was reachable but throttled or failed us.
    #[error("OCR service unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish within the configured timeout.
    #[error("OCR submission timed out after {0:?}")]
    Timeout(Duration),

    /// We could not build a request from the source location.
    #[error("malformed source location {0}")]
    MalformedLocation(String),
}

/// The OCR service reports that a recognition job itself failed.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("OCR job {job_handle} failed: {reason}")]
pub struct RecognitionFailure {
    /// The job that failed.
    pub job_handle: String,
    /// Whatever the service told us about the failure.
    pub reason: String,
}

/// A recognition payload is missing structure we need to rebuild its text.
#[derive(Debug, Error, PartialEq)]
pub enum MalformedPayloadError {
    /// No pages at all.
    #[error("payload contains no PAGE blocks")]
    NoPages,

    /// Blocks refer to a page that has no `PAGE` block.
    #[error("page {page} has no PAGE block")]
    MissingPageBlock { page: u32 },

    /// The page polygon is too small to estimate skew from.
    #[error("PAGE block for page {page} has {vertices} polygon vertices, need at least 2")]
    TooFewPolygonVertices { page: u32, vertices: usize },

    /// NaN or infinite coordinates.
    #[error("block on page {page} has non-finite coordinates")]
    NonFiniteGeometry { page: u32 },

    /// A `LINE` block has no bounding box, so we can't place it.
    #[error("LINE block {block_id:?} on page {page} has no bounding box")]
    LineWithoutGeometry { page: u32, block_id: String },

    /// The first polygon edge runs right-to-left, so the page is rotated
    /// beyond ±90° or its vertices are not in reading order.
    #[error("PAGE block for page {page} is rotated beyond ±90° or has reordered vertices")]
    UnsupportedOrientation { page: u32 },

    /// The payload could not be decoded at all.
    #[error("could not parse recognition payload: {0}")]
    Unparseable(String),
}

/// Errors from a [`crate::jobs::JobStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network trouble, throttling or a server-side error. Worth retrying.
    #[error("job store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the request outright.
    #[error("job store rejected request: {0}")]
    Rejected(String),

    /// A single call took too long.
    #[error("job store call timed out after {0:?}")]
    Timeout(Duration),

    /// A stored row could not be decoded into a [`crate::jobs::JobRecord`].
    #[error("malformed job record {document_id:?}: {reason}")]
    MalformedRecord { document_id: String, reason: String },

    /// The caller asked for a transition the state machine does not allow.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl IsKnownTransient for StoreError {
    fn is_known_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Errors from a [`crate::blob::BlobStore`].
#[derive(Debug, Error)]
pub enum BlobError {
    /// Network trouble, throttling or a server-side error. Worth retrying.
    #[error("blob store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the request outright.
    #[error("blob store rejected request: {0}")]
    Rejected(String),

    /// A single call took too long.
    #[error("blob store call timed out after {0:?}")]
    Timeout(Duration),

    /// No such blob.
    #[error("blob {0} not found")]
    NotFound(BlobLocation),

    /// Not a `s3://container/key` URI, or a key we refuse to map to a path.
    #[error("invalid blob URI {0:?}")]
    InvalidUri(String),
}

impl IsKnownTransient for BlobError {
    fn is_known_transient(&self) -> bool {
        matches!(self, BlobError::Unavailable(_) | BlobError::Timeout(_))
    }
}

/// Errors which know how to represent a timeout.
pub trait FromTimeout {
    /// Build the error reported when a call exceeds `limit`.
    fn from_timeout(limit: Duration) -> Self;
}

impl FromTimeout for StoreError {
    fn from_timeout(limit: Duration) -> Self {
        StoreError::Timeout(limit)
    }
}

impl FromTimeout for BlobError {
    fn from_timeout(limit: Duration) -> Self {
        BlobError::Timeout(limit)
    }
}

impl FromTimeout for SubmissionError {
    fn from_timeout(limit: Duration) -> Self {
        SubmissionError::Timeout(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_transience() {
        assert!(StoreError::Unavailable("throttled".to_owned()).is_known_transient());
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_known_transient());
        assert!(!StoreError::Rejected("no such table".to_owned()).is_known_transient());
    }

    #[test]
    fn test_blob_transience() {
        let missing = BlobLocation::new("bucket", "missing.pdf");
        assert!(!BlobError::NotFound(missing).is_known_transient());
        assert!(BlobError::from_timeout(Duration::from_secs(2)).is_known_transient());
    }
}
