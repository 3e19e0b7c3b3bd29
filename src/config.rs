//! Command-line configuration shared by several subcommands.
//!
//! Every option can also be set through an `OCR_BATCHER_*` environment
//! variable, or in a `.env` file.

use std::{sync::Arc, time::Duration};

use clap::{Args, ValueEnum};

use crate::{
    aws::AwsOpts,
    blob::{BlobPrefix, BlobStore, ResilientBlobStore, fs::FsBlobStore, s3::S3BlobStore},
    jobs::{JobStore, ResilientJobStore, dynamodb::DynamoJobStore, memory::MemoryJobStore},
    ocr::{
        OcrService, RateLimitedOcrService, TimedOcrService,
        textract::{OcrFeature, TextractOcrService},
    },
    pipeline::{PoolSettings, complete::CompletePool, submit::SubmitPool},
    prelude::*,
    rate_limit::RateLimit,
};

/// Where job records live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum JobStoreKind {
    /// A DynamoDB table, named by `--job-table`.
    Dynamodb,
    /// In memory. Only useful with `run`, since nothing survives the process.
    Memory,
}

/// Options for the job store and blob store.
#[derive(Args, Clone, Debug)]
pub struct StoreOpts {
    /// Which kind of job store to use.
    #[clap(long, value_enum, default_value = "dynamodb", env = "OCR_BATCHER_JOB_STORE")]
    pub job_store: JobStoreKind,

    /// The DynamoDB table holding job records.
    #[clap(long, env = "OCR_BATCHER_JOB_TABLE")]
    pub job_table: Option<String>,

    /// Serve `s3://` URIs from this local directory instead of S3. Each bucket
    /// is a subdirectory.
    #[clap(long, env = "OCR_BATCHER_BLOB_ROOT")]
    pub blob_root: Option<PathBuf>,

    /// Timeout for each job store or blob store call, in seconds.
    #[clap(long, default_value = "10", env = "OCR_BATCHER_STORE_TIMEOUT")]
    pub store_timeout: u64,

    #[clap(flatten)]
    pub aws: AwsOpts,
}

impl StoreOpts {
    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout)
    }

    /// Connect to the job store, with timeouts and retries.
    pub async fn job_store(&self) -> Result<Arc<dyn JobStore>> {
        let inner: Arc<dyn JobStore> = match self.job_store {
            JobStoreKind::Dynamodb => {
                let table = self
                    .job_table
                    .as_deref()
                    .ok_or_else(|| anyhow!("--job-table is required with a DynamoDB job store"))?;
                Arc::new(DynamoJobStore::new(&self.aws, table).await?)
            }
            JobStoreKind::Memory => Arc::new(MemoryJobStore::new()),
        };
        Ok(Arc::new(ResilientJobStore::new(inner, self.call_timeout())))
    }

    /// Connect to the blob store, with timeouts and retries.
    pub async fn blob_store(&self) -> Result<Arc<dyn BlobStore>> {
        let inner: Arc<dyn BlobStore> = match &self.blob_root {
            Some(root) => Arc::new(FsBlobStore::new(root)),
            None => Arc::new(S3BlobStore::new(&self.aws).await?),
        };
        Ok(Arc::new(ResilientBlobStore::new(inner, self.call_timeout())))
    }
}

/// Options for the OCR service.
#[derive(Args, Clone, Debug)]
pub struct OcrOpts {
    /// Extra analysis to request, e.g. `tables,forms`. Without this, we only
    /// detect text.
    #[clap(long, value_enum, value_delimiter = ',', env = "OCR_BATCHER_FEATURES")]
    pub features: Vec<OcrFeature>,

    /// Timeout for each OCR call, in seconds. A timed-out submission fails the
    /// document; a timed-out poll is retried on the next pass.
    #[clap(long, default_value = "30", env = "OCR_BATCHER_OCR_TIMEOUT")]
    pub ocr_timeout: u64,

    /// Limit OCR API calls, e.g. `10/s` or `600/m`. Waiting for the rate
    /// limit doesn't count towards `--ocr-timeout`.
    #[clap(long, env = "OCR_BATCHER_OCR_RATE_LIMIT")]
    pub ocr_rate_limit: Option<RateLimit>,
}

impl OcrOpts {
    /// Connect to the OCR service, with timeouts and an optional rate limit.
    pub async fn ocr_service(&self, aws: &AwsOpts) -> Result<Arc<dyn OcrService>> {
        let textract = Arc::new(TextractOcrService::new(aws, self.features.clone()).await?);
        let timed: Arc<dyn OcrService> = Arc::new(TimedOcrService::new(
            textract,
            Duration::from_secs(self.ocr_timeout),
        ));
        Ok(match self.ocr_rate_limit {
            Some(limit) => Arc::new(RateLimitedOcrService::new(
                timed,
                limit.to_rate_limiter(),
            )),
            None => timed,
        })
    }
}

/// Options for the worker pools.
#[derive(Args, Clone, Debug)]
pub struct PoolOpts {
    /// Records fetched from the job store per page.
    #[clap(long, default_value = "200", env = "OCR_BATCHER_BATCH_SIZE")]
    pub batch_size: usize,

    /// Concurrent submission workers.
    #[clap(long, default_value = "20", env = "OCR_BATCHER_SUBMIT_WORKERS")]
    pub submit_workers: usize,

    /// Concurrent completion workers.
    #[clap(long, default_value = "50", env = "OCR_BATCHER_COMPLETE_WORKERS")]
    pub complete_workers: usize,
}

impl PoolOpts {
    fn settings(&self, workers: usize) -> Result<PoolSettings> {
        if self.batch_size == 0 || workers == 0 {
            return Err(anyhow!("batch size and worker counts must be positive"));
        }
        Ok(PoolSettings {
            batch_size: self.batch_size,
            workers,
        })
    }

    /// Build the submission pool.
    pub fn submit_pool(
        &self,
        store: Arc<dyn JobStore>,
        ocr: Arc<dyn OcrService>,
    ) -> Result<SubmitPool> {
        Ok(SubmitPool::new(store, ocr, self.settings(self.submit_workers)?))
    }

    /// Build the completion pool, writing artifacts under `output`.
    pub fn complete_pool(
        &self,
        store: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        ocr: Arc<dyn OcrService>,
        output: BlobPrefix,
    ) -> Result<CompletePool> {
        Ok(CompletePool::new(
            store,
            blobs,
            ocr,
            output,
            self.settings(self.complete_workers)?,
        ))
    }
}
