//! OCR using the AWS Textract asynchronous APIs.

use aws_sdk_textract::types::{
    self as textract, DocumentLocation, DocumentMetadata, FeatureType,
    JobStatus as TextractJobStatus, S3Object,
};
use clap::ValueEnum;
use serde_json::{Map, Value, json};

use super::{FetchOutcome, OcrService, ResultPage};
use crate::{
    aws::{AwsOpts, SdkFailure, load_aws_config},
    blob::BlobLocation,
    errors::{RecognitionFailure, SubmissionError},
    jobs::DocumentId,
    prelude::*,
};

/// The most result blocks Textract will return per call.
const MAX_RESULTS: i32 = 1000;

/// Textract won't accept longer S3 object names.
const MAX_OBJECT_NAME_LEN: usize = 1024;

/// Extra analysis to request. With no features, we use plain text detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OcrFeature {
    /// Detect tables and their cells.
    Tables,
    /// Detect key/value form fields.
    Forms,
}

impl OcrFeature {
    fn to_feature_type(self) -> FeatureType {
        match self {
            OcrFeature::Tables => FeatureType::Tables,
            OcrFeature::Forms => FeatureType::Forms,
        }
    }
}

/// Which Textract API a job was started with. Stored as the prefix of the
/// job handle, so we know which API to poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobKind {
    Text,
    Analysis,
}

impl JobKind {
    fn prefix(self) -> &'static str {
        match self {
            JobKind::Text => "text",
            JobKind::Analysis => "analysis",
        }
    }

    fn handle(self, job_id: &str) -> String {
        format!("{}:{job_id}", self.prefix())
    }

    fn parse_handle(handle: &str) -> Option<(Self, &str)> {
        let (prefix, job_id) = handle.split_once(':')?;
        let kind = match prefix {
            "text" => JobKind::Text,
            "analysis" => JobKind::Analysis,
            _ => return None,
        };
        (!job_id.is_empty()).then_some((kind, job_id))
    }
}

/// One page of job results, from either API.
struct SdkResultPage {
    status: Option<TextractJobStatus>,
    status_message: Option<String>,
    document_metadata: Option<Value>,
    blocks: Vec<Value>,
    next_token: Option<String>,
}

/// OCR service wrapping the AWS Textract API.
pub struct TextractOcrService {
    client: aws_sdk_textract::Client,
    features: Vec<OcrFeature>,
}

impl TextractOcrService {
    /// Create a new Textract service.
    pub async fn new(aws_opts: &AwsOpts, features: Vec<OcrFeature>) -> Result<Self> {
        let config = load_aws_config(aws_opts).await?;
        Ok(Self {
            client: aws_sdk_textract::Client::new(&config),
            features,
        })
    }

    async fn fetch_page(
        &self,
        kind: JobKind,
        job_id: &str,
        next_token: Option<String>,
    ) -> Result<SdkResultPage, SdkFailure> {
        match kind {
            JobKind::Text => {
                let output = self
                    .client
                    .get_document_text_detection()
                    .job_id(job_id)
                    .max_results(MAX_RESULTS)
                    .set_next_token(next_token)
                    .send()
                    .await
                    .map_err(SdkFailure::classify)?;
                Ok(SdkResultPage {
                    status: output.job_status().cloned(),
                    status_message: output.status_message().map(str::to_owned),
                    document_metadata: output.document_metadata().map(metadata_json),
                    blocks: output.blocks().iter().map(block_json).collect(),
                    next_token: output.next_token().map(str::to_owned),
                })
            }
            JobKind::Analysis => {
                let output = self
                    .client
                    .get_document_analysis()
                    .job_id(job_id)
                    .max_results(MAX_RESULTS)
                    .set_next_token(next_token)
                    .send()
                    .await
                    .map_err(SdkFailure::classify)?;
                Ok(SdkResultPage {
                    status: output.job_status().cloned(),
                    status_message: output.status_message().map(str::to_owned),
                    document_metadata: output.document_metadata().map(metadata_json),
                    blocks: output.blocks().iter().map(block_json).collect(),
                    next_token: output.next_token().map(str::to_owned),
                })
            }
        }
    }
}

#[async_trait]
impl OcrService for TextractOcrService {
    #[instrument(level = "debug", skip_all, fields(id = %document_id))]
    async fn submit(
        &self,
        document_id: &DocumentId,
        source: &BlobLocation,
    ) -> Result<String, SubmissionError> {
        if source.key.len() > MAX_OBJECT_NAME_LEN {
            return Err(SubmissionError::MalformedLocation(source.to_uri()));
        }
        let location = DocumentLocation::builder()
            .s3_object(
                S3Object::builder()
                    .bucket(&source.container)
                    .name(&source.key)
                    .build(),
            )
            .build();
        // The same token always maps to the same Textract job, so a repeated
        // submission doesn't start a second job.
        let token = document_id.request_token();

        let (kind, job_id) = if self.features.is_empty() {
            let output = self
                .client
                .start_document_text_detection()
                .document_location(location)
                .client_request_token(token)
                .send()
                .await
                .map_err(submission_error)?;
            (JobKind::Text, output.job_id().map(str::to_owned))
        } else {
            let output = self
                .client
                .start_document_analysis()
                .document_location(location)
                .set_feature_types(Some(
                    self.features.iter().map(|f| f.to_feature_type()).collect(),
                ))
                .client_request_token(token)
                .send()
                .await
                .map_err(submission_error)?;
            (JobKind::Analysis, output.job_id().map(str::to_owned))
        };
        let job_id = job_id.ok_or_else(|| {
            SubmissionError::Rejected("Textract returned no job ID".to_owned())
        })?;
        Ok(kind.handle(&job_id))
    }

    #[instrument(level = "debug", skip(self))]
    async fn fetch_results(
        &self,
        job_handle: &str,
        next_token: Option<String>,
    ) -> FetchOutcome {
        let failed = |reason: String| {
            FetchOutcome::Failed(RecognitionFailure {
                job_handle: job_handle.to_owned(),
                reason,
            })
        };
        let Some((kind, job_id)) = JobKind::parse_handle(job_handle) else {
            return failed("unrecognized job handle".to_owned());
        };
        let first_page = next_token.is_none();

        let page = match self.fetch_page(kind, job_id, next_token).await {
            Ok(page) => page,
            Err(SdkFailure::Transient(message)) => {
                warn!(job_handle, "Could not poll Textract, will retry: {message}");
                return FetchOutcome::NotReady;
            }
            Err(failure) => return failed(failure.to_string()),
        };
        match page.status {
            Some(TextractJobStatus::InProgress) => return FetchOutcome::NotReady,
            Some(TextractJobStatus::Succeeded) => {}
            Some(TextractJobStatus::PartialSuccess) => {
                if first_page {
                    warn!(
                        job_handle,
                        "Textract job only partially succeeded: {}",
                        page.status_message.as_deref().unwrap_or("no details")
                    );
                }
            }
            Some(TextractJobStatus::Failed) => {
                return failed(
                    page.status_message
                        .unwrap_or_else(|| "job failed".to_owned()),
                );
            }
            other => return failed(format!("unexpected job status {other:?}")),
        }
        FetchOutcome::Page(ResultPage {
            blocks: page.blocks,
            document_metadata: page.document_metadata,
            next_token: page.next_token,
        })
    }
}

fn submission_error<E, R>(err: aws_sdk_textract::error::SdkError<E, R>) -> SubmissionError
where
    E: aws_sdk_textract::error::ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match SdkFailure::classify(err) {
        SdkFailure::Transient(message) => SubmissionError::Unavailable(message),
        SdkFailure::Rejected { message, .. } => SubmissionError::Rejected(message),
    }
}

/// Textract's `DocumentMetadata`, as it appears in its JSON output.
fn metadata_json(metadata: &DocumentMetadata) -> Value {
    match metadata.pages() {
        Some(pages) => json!({ "Pages": pages }),
        None => json!({}),
    }
}

/// Convert a Textract SDK block back into the JSON Textract itself writes, so
/// saved payloads look like any other Textract output.
fn block_json(block: &textract::Block) -> Value {
    let mut obj = Map::new();
    let mut put = |key: &str, value: Value| {
        obj.insert(key.to_owned(), value);
    };
    if let Some(block_type) = block.block_type() {
        put("BlockType", json!(block_type.as_str()));
    }
    if let Some(confidence) = block.confidence() {
        put("Confidence", json!(confidence));
    }
    if let Some(text) = block.text() {
        put("Text", json!(text));
    }
    if let Some(text_type) = block.text_type() {
        put("TextType", json!(text_type.as_str()));
    }
    if let Some(row_index) = block.row_index() {
        put("RowIndex", json!(row_index));
    }
    if let Some(column_index) = block.column_index() {
        put("ColumnIndex", json!(column_index));
    }
    if let Some(row_span) = block.row_span() {
        put("RowSpan", json!(row_span));
    }
    if let Some(column_span) = block.column_span() {
        put("ColumnSpan", json!(column_span));
    }
    if let Some(geometry) = block.geometry() {
        let mut geo = Map::new();
        if let Some(bbox) = geometry.bounding_box() {
            geo.insert(
                "BoundingBox".to_owned(),
                json!({
                    "Width": bbox.width(),
                    "Height": bbox.height(),
                    "Left": bbox.left(),
                    "Top": bbox.top(),
                }),
            );
        }
        let polygon = geometry
            .polygon()
            .iter()
            .map(|p| json!({ "X": p.x(), "Y": p.y() }))
            .collect::<Vec<_>>();
        geo.insert("Polygon".to_owned(), Value::Array(polygon));
        put("Geometry", Value::Object(geo));
    }
    if let Some(id) = block.id() {
        put("Id", json!(id));
    }
    if !block.relationships().is_empty() {
        let relationships = block
            .relationships()
            .iter()
            .map(|rel| {
                json!({
                    "Type": rel.r#type().map(|t| t.as_str()).unwrap_or("UNKNOWN"),
                    "Ids": rel.ids(),
                })
            })
            .collect::<Vec<_>>();
        put("Relationships", Value::Array(relationships));
    }
    if !block.entity_types().is_empty() {
        let entity_types = block
            .entity_types()
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>();
        put("EntityTypes", json!(entity_types));
    }
    if let Some(selection_status) = block.selection_status() {
        put("SelectionStatus", json!(selection_status.as_str()));
    }
    if let Some(page) = block.page() {
        put("Page", json!(page));
    }
    Value::Object(obj)
}
