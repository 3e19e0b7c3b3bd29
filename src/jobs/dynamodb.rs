//! A [`JobStore`] backed by a DynamoDB table.
//!
//! The table needs a single string hash key named `document_id`. Each record is
//! stored as one flat item of string attributes.

use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};

use super::{
    record::{DocumentId, JobRecord, JobStatus, Transition},
    store::{JobFilter, JobStore, ScanCursor, ScanPage, UpdateOutcome, apply_if_expected},
};
use crate::{
    aws::{AwsOpts, SdkFailure, load_aws_config},
    errors::StoreError,
    prelude::*,
};

/// The item type used by the SDK.
type Item = HashMap<String, AttributeValue>;

/// Error code for a failed `ConditionExpression`.
const CONDITIONAL_CHECK_FAILED: &str = "ConditionalCheckFailedException";

/// Attribute names.
const DOCUMENT_ID: &str = "document_id";
const SOURCE_URI: &str = "source_uri";
const CREATED_AT: &str = "created_at";
const UPDATED_AT: &str = "updated_at";
const STATUS: &str = "status";
const OCR_JOB_HANDLE: &str = "ocr_job_handle";
const OUTPUT_TEXT_URI: &str = "output_text_uri";
const LAST_ERROR: &str = "last_error";

/// Job store wrapping a DynamoDB table.
#[derive(Clone, Debug)]
pub struct DynamoJobStore {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoJobStore {
    /// Create a store for `table`.
    pub async fn new(aws_opts: &AwsOpts, table: impl Into<String>) -> Result<Self> {
        let config = load_aws_config(aws_opts).await?;
        Ok(Self {
            client: aws_sdk_dynamodb::Client::new(&config),
            table: table.into(),
        })
    }
}

fn store_error(failure: SdkFailure) -> StoreError {
    match failure {
        SdkFailure::Transient(message) => StoreError::Unavailable(message),
        SdkFailure::Rejected { message, .. } => StoreError::Rejected(message),
    }
}

fn key_for(document_id: &DocumentId) -> Item {
    HashMap::from([(
        DOCUMENT_ID.to_owned(),
        AttributeValue::S(document_id.as_str().to_owned()),
    )])
}

/// Encode a record as an item.
fn record_to_item(record: &JobRecord) -> Item {
    let mut item = key_for(&record.document_id);
    let mut put = |name: &str, value: String| {
        item.insert(name.to_owned(), AttributeValue::S(value));
    };
    put(SOURCE_URI, record.source.to_uri());
    put(CREATED_AT, record.created_at.to_rfc3339());
    put(UPDATED_AT, record.updated_at.to_rfc3339());
    put(STATUS, record.status.as_str().to_owned());
    if let Some(handle) = &record.ocr_job_handle {
        put(OCR_JOB_HANDLE, handle.clone());
    }
    if let Some(output) = &record.output_text_location {
        put(OUTPUT_TEXT_URI, output.to_uri());
    }
    if let Some(error) = &record.last_error {
        put(LAST_ERROR, error.clone());
    }
    item
}

/// Decode an item into a record.
fn item_to_record(item: &Item) -> Result<JobRecord, StoreError> {
    let document_id = optional_string(item, DOCUMENT_ID).unwrap_or_default();
    let malformed = |reason: String| StoreError::MalformedRecord {
        document_id: document_id.clone(),
        reason,
    };
    let required = |name: &str| {
        optional_string(item, name).ok_or_else(|| malformed(format!("missing {name}")))
    };
    let timestamp = |name: &str| -> Result<DateTime<Utc>, StoreError> {
        let raw = required(name)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|err| malformed(format!("bad {name} {raw:?}: {err}")))
    };

    let record = JobRecord {
        document_id: DocumentId::new(required(DOCUMENT_ID)?),
        source: required(SOURCE_URI)?
            .parse()
            .map_err(|err| malformed(format!("bad {SOURCE_URI}: {err}")))?,
        created_at: timestamp(CREATED_AT)?,
        updated_at: timestamp(UPDATED_AT)?,
        status: required(STATUS)?
            .parse()
            .map_err(|err| malformed(format!("{err}")))?,
        ocr_job_handle: optional_string(item, OCR_JOB_HANDLE),
        output_text_location: optional_string(item, OUTPUT_TEXT_URI)
            .map(|uri| uri.parse())
            .transpose()
            .map_err(|err| malformed(format!("bad {OUTPUT_TEXT_URI}: {err}")))?,
        last_error: optional_string(item, LAST_ERROR),
    };
    record.check_invariants().map_err(malformed)?;
    Ok(record)
}

fn optional_string(item: &Item, name: &str) -> Option<String> {
    item.get(name)
        .and_then(|value| value.as_s().ok())
        .cloned()
}

/// A filter expression, plus the attribute names and values it uses.
struct ScanFilter {
    expression: Option<String>,
    names: Option<HashMap<String, String>>,
    values: Option<Item>,
}

impl ScanFilter {
    fn new(filter: JobFilter) -> Self {
        let status_filter = |status: JobStatus, extra: &str| ScanFilter {
            expression: Some(format!("#s = :status{extra}")),
            names: Some(HashMap::from([("#s".to_owned(), STATUS.to_owned())])),
            values: Some(HashMap::from([(
                ":status".to_owned(),
                AttributeValue::S(status.as_str().to_owned()),
            )])),
        };
        match filter {
            JobFilter::All => ScanFilter {
                expression: None,
                names: None,
                values: None,
            },
            JobFilter::Status(status) => status_filter(status, ""),
            JobFilter::AwaitingOutput => status_filter(
                JobStatus::Submitted,
                &format!(" AND attribute_not_exists({OUTPUT_TEXT_URI})"),
            ),
        }
    }
}

#[async_trait]
impl JobStore for DynamoJobStore {
    #[instrument(level = "debug", skip(self), fields(table = %self.table))]
    async fn get(&self, document_id: &DocumentId) -> Result<Option<JobRecord>, StoreError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .set_key(Some(key_for(document_id)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|err| store_error(SdkFailure::classify(err)))?;
        output.item().map(item_to_record).transpose()
    }

    #[instrument(level = "debug", skip_all, fields(table = %self.table, id = %record.document_id))]
    async fn upsert_if_absent(&self, record: JobRecord) -> Result<bool, StoreError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(record_to_item(&record)))
            .condition_expression(format!("attribute_not_exists({DOCUMENT_ID})"))
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) => match SdkFailure::classify(err) {
                failure if failure.code() == Some(CONDITIONAL_CHECK_FAILED) => Ok(false),
                failure => Err(store_error(failure)),
            },
        }
    }

    #[instrument(level = "debug", skip(self, transition), fields(table = %self.table))]
    async fn conditional_update(
        &self,
        document_id: &DocumentId,
        expected: JobStatus,
        transition: Transition,
    ) -> Result<UpdateOutcome, StoreError> {
        let Some(mut record) = self.get(document_id).await? else {
            return Ok(UpdateOutcome::Skipped { current: None });
        };
        let outcome = apply_if_expected(&mut record, expected, transition)?;
        if !outcome.is_applied() {
            return Ok(outcome);
        }

        // Someone else may have moved the record since we read it. The
        // condition makes sure we only overwrite the state we validated
        // against.
        let result = self
            .client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(record_to_item(&record)))
            .condition_expression("#s = :expected")
            .expression_attribute_names("#s", STATUS)
            .expression_attribute_values(
                ":expected",
                AttributeValue::S(expected.as_str().to_owned()),
            )
            .send()
            .await;
        match result {
            Ok(_) => Ok(outcome),
            Err(err) => match SdkFailure::classify(err) {
                failure if failure.code() == Some(CONDITIONAL_CHECK_FAILED) => {
                    debug!("Lost race updating {document_id}");
                    Ok(UpdateOutcome::Skipped { current: None })
                }
                failure => Err(store_error(failure)),
            },
        }
    }

    #[instrument(level = "debug", skip(self, after), fields(table = %self.table))]
    async fn scan(
        &self,
        filter: JobFilter,
        page_size: usize,
        after: Option<ScanCursor>,
    ) -> Result<ScanPage, StoreError> {
        let limit = i32::try_from(page_size)
            .ok()
            .filter(|&limit| limit > 0)
            .ok_or_else(|| StoreError::Rejected(format!("bad page size {page_size}")))?;
        let ScanFilter {
            expression,
            names,
            values,
        } = ScanFilter::new(filter);
        let output = self
            .client
            .scan()
            .table_name(&self.table)
            .consistent_read(true)
            .limit(limit)
            .set_filter_expression(expression)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values)
            .set_exclusive_start_key(after.map(|ScanCursor(id)| key_for(&id)))
            .send()
            .await
            .map_err(|err| store_error(SdkFailure::classify(err)))?;

        let records = output
            .items()
            .iter()
            .map(item_to_record)
            .collect::<Result<Vec<_>, _>>()?;
        let next = output
            .last_evaluated_key()
            .and_then(|key| optional_string(key, DOCUMENT_ID))
            .map(|id| ScanCursor(DocumentId::new(id)));
        Ok(ScanPage { records, next })
    }
}
