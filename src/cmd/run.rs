//! The `discover`, `submit`, `complete` and `run` subcommands.

use std::time::Duration;

use clap::Args;

use crate::{
    blob::BlobPrefix,
    config::{OcrOpts, PoolOpts, StoreOpts},
    pipeline::{discovery::discover_jobs, orchestrator::Orchestrator},
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// Options for `discover`.
#[derive(Debug, Args)]
pub struct DiscoverOpts {
    /// Where the source documents are, e.g. `s3://scans/incoming`.
    #[clap(long, env = "OCR_BATCHER_SOURCE")]
    pub source: BlobPrefix,

    #[clap(flatten)]
    pub store: StoreOpts,
}

/// Options for `submit`.
#[derive(Debug, Args)]
pub struct SubmitOpts {
    #[clap(flatten)]
    pub store: StoreOpts,

    #[clap(flatten)]
    pub ocr: OcrOpts,

    #[clap(flatten)]
    pub pools: PoolOpts,
}

/// Options for `complete`.
#[derive(Debug, Args)]
pub struct CompleteOpts {
    /// Where to write text and metrics, e.g. `s3://text/out`.
    #[clap(long, env = "OCR_BATCHER_OUTPUT")]
    pub output: BlobPrefix,

    #[clap(flatten)]
    pub store: StoreOpts,

    #[clap(flatten)]
    pub ocr: OcrOpts,

    #[clap(flatten)]
    pub pools: PoolOpts,
}

/// Options for `run`.
#[derive(Debug, Args)]
pub struct RunOpts {
    /// Where the source documents are. If omitted, only documents already in
    /// the job store are processed.
    #[clap(long, env = "OCR_BATCHER_SOURCE")]
    pub source: Option<BlobPrefix>,

    /// Where to write text and metrics.
    #[clap(long, env = "OCR_BATCHER_OUTPUT")]
    pub output: BlobPrefix,

    /// Seconds to wait between iterations while OCR jobs are running.
    #[clap(long, default_value = "30", env = "OCR_BATCHER_POLL_INTERVAL")]
    pub poll_interval: u64,

    /// Give up after this many iterations.
    #[clap(long, env = "OCR_BATCHER_MAX_ITERATIONS")]
    pub max_iterations: Option<usize>,

    #[clap(flatten)]
    pub store: StoreOpts,

    #[clap(flatten)]
    pub ocr: OcrOpts,

    #[clap(flatten)]
    pub pools: PoolOpts,
}

/// The `discover` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_discover(ui: &Ui, opts: &DiscoverOpts) -> Result<()> {
    let blobs = opts.store.blob_store().await?;
    let store = opts.store.job_store().await?;
    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "🔎",
        msg: "Discovering documents",
        done_msg: "Discovered documents",
    });
    let report = discover_jobs(blobs.as_ref(), store.as_ref(), &opts.source).await?;
    spinner.finish_using_style();
    ui.display_message(
        "📄",
        &format!(
            "{} documents found, {} newly registered",
            report.found, report.registered
        ),
    );
    Ok(())
}

/// The `submit` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_submit(ui: &Ui, opts: &SubmitOpts) -> Result<()> {
    let store = opts.store.job_store().await?;
    let ocr = opts.ocr.ocr_service(&opts.store.aws).await?;
    let pool = opts.pools.submit_pool(store, ocr)?;
    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "📤",
        msg: "Submitting documents",
        done_msg: "Submitted documents",
    });
    let summary = pool.run_until_drained().await?;
    spinner.finish_using_style();
    ui.display_message("📤", &summary.to_string());
    Ok(())
}

/// The `complete` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_complete(ui: &Ui, opts: &CompleteOpts) -> Result<()> {
    let store = opts.store.job_store().await?;
    let blobs = opts.store.blob_store().await?;
    let ocr = opts.ocr.ocr_service(&opts.store.aws).await?;
    let pool = opts
        .pools
        .complete_pool(store, blobs, ocr, opts.output.clone())?;
    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "📥",
        msg: "Collecting OCR results",
        done_msg: "Collected OCR results",
    });
    let summary = pool.run_pass().await?;
    spinner.finish_using_style();
    ui.display_message("📥", &summary.to_string());
    Ok(())
}

/// The `run` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: &Ui, opts: &RunOpts) -> Result<()> {
    let store = opts.store.job_store().await?;
    let blobs = opts.store.blob_store().await?;
    let ocr = opts.ocr.ocr_service(&opts.store.aws).await?;
    let orchestrator = Orchestrator {
        submit: opts.pools.submit_pool(store.clone(), ocr.clone())?,
        complete: opts.pools.complete_pool(
            store.clone(),
            blobs.clone(),
            ocr,
            opts.output.clone(),
        )?,
        blobs,
        store,
        source: opts.source.clone(),
        poll_interval: Duration::from_secs(opts.poll_interval),
        max_iterations: opts.max_iterations,
    };

    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "⚙️",
        msg: "Processing documents",
        done_msg: "Processed documents",
    });
    let summary = orchestrator.run().await?;
    spinner.finish_using_style();
    ui.display_message("📤", &format!("Submission: {}", summary.submit));
    ui.display_message("📥", &format!("Completion: {}", summary.complete));
    if !summary.drained {
        ui.display_message(
            "⏳",
            &format!(
                "Stopped after {} iterations with OCR jobs still running",
                summary.iterations
            ),
        );
    }
    Ok(())
}
