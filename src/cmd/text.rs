//! The `text` and `metrics` subcommands, which work on a single saved
//! recognition payload.

use std::sync::Arc;

use clap::Args;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::create_writer,
    aws::AwsOpts,
    blob::{BlobStore, fs::FsBlobStore, is_blob_uri, read_uri_or_path, s3::S3BlobStore},
    layout::{DocumentMetrics, RecognitionPayload, reconstruct_document},
    prelude::*,
};

/// Options for reading a payload.
#[derive(Debug, Args)]
pub struct PayloadOpts {
    /// A recognition payload (Textract JSON), as a local path or `s3://` URI.
    pub input: String,

    /// Where to write the result. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Serve `s3://` URIs from this local directory instead of S3.
    #[clap(long, env = "OCR_BATCHER_BLOB_ROOT")]
    pub blob_root: Option<PathBuf>,

    #[clap(flatten)]
    pub aws: AwsOpts,
}

impl PayloadOpts {
    async fn read_payload(&self) -> Result<RecognitionPayload> {
        let store: Option<Arc<dyn BlobStore>> = match (&self.blob_root, is_blob_uri(&self.input)) {
            (_, false) => None,
            (Some(root), true) => Some(Arc::new(FsBlobStore::new(root))),
            (None, true) => Some(Arc::new(S3BlobStore::new(&self.aws).await?)),
        };
        let data = read_uri_or_path(store.as_deref(), &self.input).await?;
        RecognitionPayload::from_json(&data)
            .with_context(|| format!("failed to read payload from {}", self.input))
    }

    async fn write(&self, mut output: String) -> Result<()> {
        if !output.ends_with('\n') {
            output.push('\n');
        }
        let mut wtr = create_writer(self.output_path.as_deref()).await?;
        wtr.write_all(output.as_bytes())
            .await
            .context("failed to write output")?;
        wtr.flush().await.context("failed to flush output")?;
        Ok(())
    }
}

/// The `text` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_text(opts: &PayloadOpts) -> Result<()> {
    let payload = opts.read_payload().await?;
    let document = reconstruct_document(&payload)
        .with_context(|| format!("could not reconstruct text from {}", opts.input))?;
    opts.write(document.text).await
}

/// The `metrics` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_metrics(opts: &PayloadOpts) -> Result<()> {
    let payload = opts.read_payload().await?;
    let metrics = DocumentMetrics::for_payload(&payload);
    let json = serde_json::to_string_pretty(&metrics).context("failed to serialize metrics")?;
    opts.write(json).await
}
