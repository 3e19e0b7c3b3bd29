//! A [`BlobStore`] backed by Amazon S3.

use aws_sdk_s3::primitives::ByteStream;

use super::{BlobLocation, BlobPrefix, BlobStore};
use crate::{
    aws::{AwsOpts, SdkFailure, load_aws_config},
    errors::BlobError,
    prelude::*,
};

/// S3 error codes meaning the object is not there.
const NOT_FOUND_CODES: &[&str] = &["NoSuchKey", "NotFound"];

/// Blob store wrapping the S3 API.
#[derive(Clone, Debug)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
}

impl S3BlobStore {
    /// Create a new S3 blob store.
    pub async fn new(aws_opts: &AwsOpts) -> Result<Self> {
        let config = load_aws_config(aws_opts).await?;
        Ok(Self {
            client: aws_sdk_s3::Client::new(&config),
        })
    }
}

/// Convert an SDK failure for `location`.
fn blob_error(location: &BlobLocation, failure: SdkFailure) -> BlobError {
    match failure {
        SdkFailure::Rejected { code: Some(code), .. }
            if NOT_FOUND_CODES.contains(&code.as_str()) =>
        {
            BlobError::NotFound(location.clone())
        }
        SdkFailure::Transient(message) => BlobError::Unavailable(message),
        SdkFailure::Rejected { message, .. } => BlobError::Rejected(message),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(level = "debug", skip(self), fields(location = %location))]
    async fn read(&self, location: &BlobLocation) -> Result<Vec<u8>, BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(&location.container)
            .key(&location.key)
            .send()
            .await
            .map_err(|err| blob_error(location, SdkFailure::classify(err)))?;
        let body = output
            .body
            .collect()
            .await
            .map_err(|err| BlobError::Unavailable(format!("{location}: {err}")))?;
        Ok(body.into_bytes().to_vec())
    }

    #[instrument(level = "debug", skip(self, data), fields(location = %location, bytes = data.len()))]
    async fn write(&self, location: &BlobLocation, data: Vec<u8>) -> Result<(), BlobError> {
        let content_type = if location.key.ends_with(".json") {
            "application/json"
        } else {
            "text/plain; charset=utf-8"
        };
        self.client
            .put_object()
            .bucket(&location.container)
            .key(&location.key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|err| blob_error(location, SdkFailure::classify(err)))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(prefix = %prefix))]
    async fn list(&self, prefix: &BlobPrefix) -> Result<Vec<BlobLocation>, BlobError> {
        let list_prefix = if prefix.prefix.is_empty() {
            None
        } else {
            Some(format!("{}/", prefix.prefix))
        };
        let mut found = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&prefix.container)
                .set_prefix(list_prefix.clone())
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|err| match SdkFailure::classify(err) {
                    SdkFailure::Transient(message) => BlobError::Unavailable(message),
                    SdkFailure::Rejected { message, .. } => BlobError::Rejected(message),
                })?;
            for object in output.contents() {
                // Skip "directory" placeholder objects.
                if let Some(key) = object.key()
                    && !key.ends_with('/')
                {
                    found.push(BlobLocation::new(&prefix.container, key));
                }
            }
            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_owned());
                }
                _ => break,
            }
        }
        debug!(count = found.len(), "Listed source blobs");
        Ok(found)
    }
}
