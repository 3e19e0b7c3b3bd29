//! Job records and the per-document state machine.
//!
//! ```text
//! PENDING ──► SUBMITTED ──► COMPLETE
//!    │            │
//!    ▼            ▼
//! FAILED_SUBMIT  FAILED_CONVERT
//!    │            │
//!    └──► PENDING ◄┘   (explicit reset only)
//! ```

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use thiserror::Error;
use uuid::Uuid;

use crate::{blob::BlobLocation, prelude::*};

/// Stable identity of a source document, derived from its location.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Wrap an existing identifier, e.g. one typed on the command line.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity of the document stored at `location`. Two distinct
    /// locations always produce distinct ids.
    pub fn for_location(location: &BlobLocation) -> Self {
        Self(format!("{}/{}", location.container, location.key))
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A short token derived from this id, suitable for idempotent service
    /// requests and for disambiguating artifact names.
    pub fn request_token(&self) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, self.0.as_bytes()).to_string()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a document is in its lifecycle.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Discovered, not yet sent to OCR.
    Pending,
    /// Sent to OCR; we hold a job handle.
    Submitted,
    /// The OCR service would not take the document.
    FailedSubmit,
    /// Text has been written.
    Complete,
    /// OCR failed, or its output could not be turned into text.
    FailedConvert,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Submitted,
        JobStatus::FailedSubmit,
        JobStatus::Complete,
        JobStatus::FailedConvert,
    ];

    /// The name used in storage and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::FailedSubmit => "FAILED_SUBMIT",
            JobStatus::Complete => "COMPLETE",
            JobStatus::FailedConvert => "FAILED_CONVERT",
        }
    }

    /// Is this a terminal failure, only recoverable by a reset?
    pub fn is_failed(self) -> bool {
        matches!(self, JobStatus::FailedSubmit | JobStatus::FailedConvert)
    }

    /// Must a record in this status carry an OCR job handle?
    pub fn has_job_handle(self) -> bool {
        matches!(
            self,
            JobStatus::Submitted | JobStatus::Complete | JobStatus::FailedConvert
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow!("Unknown job status: {:?}", s))
    }
}

/// A requested change to a [`JobRecord`].
#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    /// `PENDING → SUBMITTED`.
    Submitted { job_handle: String },
    /// `PENDING → FAILED_SUBMIT`.
    SubmitFailed { error: String },
    /// `SUBMITTED → COMPLETE`. The artifact must already exist.
    Completed { output: BlobLocation },
    /// `SUBMITTED → FAILED_CONVERT`.
    ConvertFailed { error: String },
    /// `FAILED_* → PENDING`.
    Reset,
}

impl Transition {
    /// The status a record will have after this transition.
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Submitted { .. } => JobStatus::Submitted,
            Transition::SubmitFailed { .. } => JobStatus::FailedSubmit,
            Transition::Completed { .. } => JobStatus::Complete,
            Transition::ConvertFailed { .. } => JobStatus::FailedConvert,
            Transition::Reset => JobStatus::Pending,
        }
    }

    /// May a record in `from` take this transition?
    pub fn allowed_from(&self, from: JobStatus) -> bool {
        match self {
            Transition::Submitted { .. } | Transition::SubmitFailed { .. } => {
                from == JobStatus::Pending
            }
            Transition::Completed { .. } | Transition::ConvertFailed { .. } => {
                from == JobStatus::Submitted
            }
            Transition::Reset => from.is_failed(),
        }
    }
}

/// A transition the state machine does not allow.
#[derive(Debug, Error, PartialEq)]
#[error("job {document_id}: cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub document_id: DocumentId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// The tracked state of one source document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    /// Primary key. Never changes.
    pub document_id: DocumentId,

    /// Where the original document lives. Never changes.
    #[schemars(with = "String")]
    pub source: BlobLocation,

    /// When discovery first saw this document.
    pub created_at: DateTime<Utc>,

    /// When this record last changed.
    pub updated_at: DateTime<Utc>,

    /// Current lifecycle state.
    pub status: JobStatus,

    /// Assigned by the OCR service on submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_job_handle: Option<String>,

    /// Where the reconstructed text was written. Only set once complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub output_text_location: Option<BlobLocation>,

    /// Why the most recent failure happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl JobRecord {
    /// A fresh `PENDING` record for the document at `source`.
    pub fn new_pending(source: BlobLocation, now: DateTime<Utc>) -> Self {
        Self {
            document_id: DocumentId::for_location(&source),
            source,
            created_at: now,
            updated_at: now,
            status: JobStatus::Pending,
            ocr_job_handle: None,
            output_text_location: None,
            last_error: None,
        }
    }

    /// Apply `transition`, or explain why we can't.
    pub fn apply(
        &mut self,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !transition.allowed_from(self.status) {
            return Err(InvalidTransition {
                document_id: self.document_id.clone(),
                from: self.status,
                to: transition.target(),
            });
        }
        self.status = transition.target();
        self.updated_at = now;
        match transition {
            Transition::Submitted { job_handle } => {
                self.ocr_job_handle = Some(job_handle);
                self.last_error = None;
            }
            Transition::SubmitFailed { error } | Transition::ConvertFailed { error } => {
                self.last_error = Some(error);
            }
            Transition::Completed { output } => {
                self.output_text_location = Some(output);
                self.last_error = None;
            }
            Transition::Reset => {
                self.ocr_job_handle = None;
                self.output_text_location = None;
                self.last_error = None;
            }
        }
        debug_assert!(self.check_invariants().is_ok());
        Ok(())
    }

    /// Check the relationships between `status` and the optional fields.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.document_id != DocumentId::for_location(&self.source) {
            return Err(format!(
                "document id {} does not match source {}",
                self.document_id, self.source
            ));
        }
        if self.ocr_job_handle.is_some() != self.status.has_job_handle() {
            return Err(format!(
                "status {} with job handle {:?}",
                self.status, self.ocr_job_handle
            ));
        }
        if self.output_text_location.is_some() != (self.status == JobStatus::Complete) {
            return Err(format!(
                "status {} with output location {:?}",
                self.status, self.output_text_location
            ));
        }
        Ok(())
    }
}
