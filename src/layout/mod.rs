//! Turning recognition payloads into text and metrics. No I/O happens here.

pub mod metrics;
pub mod payload;
pub mod reconstruct;

pub use metrics::DocumentMetrics;
pub use payload::RecognitionPayload;
pub use reconstruct::reconstruct_document;
