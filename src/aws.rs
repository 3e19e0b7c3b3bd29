//! AWS-related code shared by different modules.

use std::{error, fmt};

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use clap::Args;

use crate::prelude::*;

/// Options for talking to AWS. Credentials always come from the standard
/// AWS environment variables and config files.
#[derive(Args, Clone, Debug, Default)]
pub struct AwsOpts {
    /// AWS region to use, overriding the usual AWS configuration.
    #[clap(long, env = "OCR_BATCHER_AWS_REGION")]
    pub aws_region: Option<String>,

    /// Custom endpoint URL for all AWS services, e.g. for a local emulator.
    #[clap(long, env = "OCR_BATCHER_AWS_ENDPOINT_URL")]
    pub aws_endpoint_url: Option<String>,
}

/// Load the user's AWS configuration using standard conventions.
pub async fn load_aws_config(opts: &AwsOpts) -> Result<aws_config::SdkConfig> {
    let mut loader = aws_config::defaults(BehaviorVersion::v2025_01_17());
    if let Some(region) = &opts.aws_region {
        loader = loader.region(Region::new(region.clone()));
    }
    if let Some(endpoint_url) = &opts.aws_endpoint_url {
        loader = loader.endpoint_url(endpoint_url);
    }
    Ok(loader.load().await)
}

/// Service error codes which mean "slow down" or "try again later".
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "ThrottlingException",
    "ProvisionedThroughputExceeded",
    "LimitExceededException",
    "InternalServerError",
    "InternalError",
    "ServiceUnavailable",
    "SlowDown",
];

/// How an AWS SDK call failed.
#[derive(Debug)]
pub enum SdkFailure {
    /// Network trouble, throttling or a server-side error.
    Transient(String),
    /// The service answered with a definite "no". Carries the error code, if
    /// any.
    Rejected {
        code: Option<String>,
        message: String,
    },
}

impl SdkFailure {
    /// Sort an SDK error. The message includes the full error chain, because
    /// the top-level [`SdkError`] message is usually just "service error".
    pub fn classify<E, R>(err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + error::Error + 'static,
        R: fmt::Debug,
    {
        let message = DisplayErrorContext(&err).to_string();
        match &err {
            SdkError::ServiceError(service_err) => {
                let code = service_err.err().code().map(str::to_owned);
                if code
                    .as_deref()
                    .is_some_and(|code| TRANSIENT_ERROR_CODES.contains(&code))
                {
                    SdkFailure::Transient(message)
                } else {
                    SdkFailure::Rejected { code, message }
                }
            }
            // Timeouts, dispatch failures and unparseable responses.
            _ => SdkFailure::Transient(message),
        }
    }

    /// The error code reported by the service, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            SdkFailure::Transient(_) => None,
            SdkFailure::Rejected { code, .. } => code.as_deref(),
        }
    }
}

impl fmt::Display for SdkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdkFailure::Transient(message) => write!(f, "{message}"),
            SdkFailure::Rejected { message, .. } => write!(f, "{message}"),
        }
    }
}
