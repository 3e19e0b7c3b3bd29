use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod aws;
mod blob;
mod cmd;
mod config;
mod errors;
mod jobs;
mod layout;
mod ocr;
mod pipeline;
mod prelude;
mod queues;
mod rate_limit;
mod retry;
mod ui;

/// OCR scanned documents in bulk, and rebuild their text in reading order.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - AWS_REGION, AWS_PROFILE, AWS_ACCESS_KEY_ID, etc.: Standard AWS
    environment variables and credential files are used for Textract,
    S3 and DynamoDB.
  - OCR_BATCHER_*: Defaults for most options. See each subcommand's --help.
  - RUST_LOG: Logging filter, e.g. `ocr_batcher=debug`.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Find source documents and register them as PENDING jobs.
    Discover(cmd::run::DiscoverOpts),
    /// Submit PENDING jobs to OCR.
    Submit(cmd::run::SubmitOpts),
    /// Collect finished OCR jobs and write their text.
    Complete(cmd::run::CompleteOpts),
    /// Discover, submit and complete until every job is finished.
    Run(cmd::run::RunOpts),
    /// Move failed jobs back to PENDING so they will be retried.
    Reset(cmd::jobs::ResetOpts),
    /// Count jobs by status.
    Status(cmd::jobs::StatusOpts),
    /// Rebuild reading-order text from a saved OCR payload.
    Text(cmd::text::PayloadOpts),
    /// Compute document metrics for a saved OCR payload.
    Metrics(cmd::text::PayloadOpts),
    /// Print schemas for output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Discover(_)
            | Cmd::Submit(_)
            | Cmd::Complete(_)
            | Cmd::Run(_)
            | Cmd::Reset(_) => false,
            Cmd::Status(_) => true,
            Cmd::Text(opts) | Cmd::Metrics(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Discover(opts) => cmd::run::cmd_discover(&ui, opts).await?,
        Cmd::Submit(opts) => cmd::run::cmd_submit(&ui, opts).await?,
        Cmd::Complete(opts) => cmd::run::cmd_complete(&ui, opts).await?,
        Cmd::Run(opts) => cmd::run::cmd_run(&ui, opts).await?,
        Cmd::Reset(opts) => cmd::jobs::cmd_reset(&ui, opts).await?,
        Cmd::Status(opts) => cmd::jobs::cmd_status(opts).await?,
        Cmd::Text(opts) => cmd::text::cmd_text(opts).await?,
        Cmd::Metrics(opts) => cmd::text::cmd_metrics(opts).await?,
        Cmd::Schema(schema_opts) => cmd::schema::cmd_schema(schema_opts).await?,
    }
    Ok(())
}
