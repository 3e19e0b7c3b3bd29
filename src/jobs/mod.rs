//! Tracking the state of each source document.

pub mod dynamodb;
pub mod memory;
mod record;
mod store;

pub use record::{DocumentId, InvalidTransition, JobRecord, JobStatus, Transition};
pub use store::{
    JobFilter, JobStore, ResilientJobStore, UpdateOutcome, reset_failed, scan_pages,
};
