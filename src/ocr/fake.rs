//! A scripted [`OcrService`] for tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::Duration,
};

use tokio::time;

use serde_json::Value;

use super::{FetchOutcome, OcrService, PollOutcome, ResultPage};
use crate::{
    blob::BlobLocation,
    errors::SubmissionError,
    jobs::DocumentId,
    layout::{
        RecognitionPayload,
        payload::{Block, BlockKind, BoundingBox, Geometry, Point, TextBlock},
    },
    prelude::*,
};

/// Handles look like `fake:<source key>`.
pub fn handle_for(key: &str) -> String {
    format!("fake:{key}")
}

/// A one-page payload with one line per entry in `lines`, top to bottom.
pub fn payload_with_lines(lines: &[&str]) -> RecognitionPayload {
    let mut blocks = vec![Block {
        id: "page".to_owned(),
        page: 1,
        geometry: Some(Geometry {
            bounding_box: None,
            polygon: vec![Point { x: 0.0, y: 0.0 }, Point { x: 1.0, y: 0.0 }],
        }),
        relationships: vec![],
        kind: BlockKind::Page,
    }];
    for (i, text) in lines.iter().enumerate() {
        blocks.push(Block {
            id: format!("line{i}"),
            page: 1,
            geometry: Some(Geometry {
                bounding_box: Some(BoundingBox {
                    width: 0.5,
                    height: 0.02,
                    left: 0.1,
                    top: 0.1 + 0.1 * i as f64,
                }),
                polygon: vec![],
            }),
            relationships: vec![],
            kind: BlockKind::Line(TextBlock {
                text: (*text).to_owned(),
            }),
        });
    }
    RecognitionPayload::from_blocks(blocks)
}

#[derive(Debug, Default)]
struct FakeState {
    rejected: HashSet<String>,
    hanging_submits: HashSet<String>,
    hanging_polls: HashSet<String>,
    outcomes: HashMap<String, PollOutcome>,
    submissions: Vec<DocumentId>,
    page_size: Option<usize>,
    page_delay: Duration,
}

/// An OCR service that does whatever the test tells it to. Unless told
/// otherwise, it accepts every submission and reports every job as not ready.
#[derive(Debug, Default)]
pub struct FakeOcrService {
    state: Mutex<FakeState>,
}

impl FakeOcrService {
    /// Reject submissions of the source with this key.
    pub fn reject(&self, key: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.rejected.insert(key.to_owned());
    }

    /// Never answer submissions of the source with this key.
    pub fn hang_on_submit(&self, key: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.hanging_submits.insert(key.to_owned());
    }

    /// Never answer polls of this handle.
    pub fn hang_on_poll(&self, handle: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.hanging_polls.insert(handle.to_owned());
    }

    /// Report `outcome` when `handle` is polled.
    pub fn finish(&self, handle: &str, outcome: PollOutcome) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.outcomes.insert(handle.to_owned(), outcome);
    }

    /// Split finished results into pages of `page_size` blocks, taking
    /// `delay` to serve each page.
    pub fn paginate(&self, page_size: usize, delay: Duration) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.page_size = Some(page_size.max(1));
        state.page_delay = delay;
    }

    /// Every accepted submission, in order.
    pub fn submissions(&self) -> Vec<DocumentId> {
        let state = self.state.lock().expect("lock poisoned");
        state.submissions.clone()
    }
}

#[async_trait]
impl OcrService for FakeOcrService {
    async fn submit(
        &self,
        document_id: &DocumentId,
        source: &BlobLocation,
    ) -> Result<String, SubmissionError> {
        let hang = {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.rejected.contains(&source.key) {
                return Err(SubmissionError::Rejected(format!(
                    "unsupported document {source}"
                )));
            }
            let hang = state.hanging_submits.contains(&source.key);
            if !hang {
                state.submissions.push(document_id.clone());
            }
            hang
        };
        if hang {
            time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(handle_for(&source.key))
    }

    async fn fetch_results(
        &self,
        job_handle: &str,
        next_token: Option<String>,
    ) -> FetchOutcome {
        let (hang, outcome, page_size, delay) = {
            let state = self.state.lock().expect("lock poisoned");
            (
                state.hanging_polls.contains(job_handle),
                state.outcomes.get(job_handle).cloned(),
                state.page_size,
                state.page_delay,
            )
        };
        if hang {
            time::sleep(Duration::from_secs(3600)).await;
        }
        time::sleep(delay).await;
        let payload = match outcome {
            None | Some(PollOutcome::NotReady) => return FetchOutcome::NotReady,
            Some(PollOutcome::Failed(failure)) => return FetchOutcome::Failed(failure),
            Some(PollOutcome::Ready(payload)) => payload,
        };

        let document = serde_json::from_slice::<Value>(payload.raw_json()).unwrap();
        let blocks = document["Blocks"].as_array().cloned().unwrap_or_default();
        let page_size = page_size.unwrap_or(blocks.len().max(1));
        let start = next_token.map_or(0, |token| token.parse::<usize>().unwrap());
        let end = (start + page_size).min(blocks.len());
        FetchOutcome::Page(ResultPage {
            blocks: blocks[start..end].to_vec(),
            document_metadata: document.get("DocumentMetadata").cloned(),
            next_token: (end < blocks.len()).then(|| end.to_string()),
        })
    }
}
