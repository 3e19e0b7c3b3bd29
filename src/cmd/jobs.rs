//! The `reset` and `status` subcommands.

use std::collections::BTreeMap;

use clap::Args;
use futures::TryStreamExt as _;

use crate::{
    config::StoreOpts,
    jobs::{DocumentId, JobFilter, JobStatus, UpdateOutcome, reset_failed, scan_pages},
    pipeline::discovery::reset_all_failed,
    prelude::*,
    ui::Ui,
};

/// Page size for administrative scans.
const SCAN_PAGE_SIZE: usize = 200;

/// Options for `reset`.
#[derive(Debug, Args)]
#[clap(group = clap::ArgGroup::new("targets").required(true).multiple(false))]
pub struct ResetOpts {
    /// Document IDs to reset, as `container/key`.
    #[clap(group = "targets")]
    pub document_ids: Vec<String>,

    /// Reset every failed document.
    #[clap(long, group = "targets")]
    pub all_failed: bool,

    #[clap(flatten)]
    pub store: StoreOpts,
}

/// Options for `status`.
#[derive(Debug, Args)]
pub struct StatusOpts {
    #[clap(flatten)]
    pub store: StoreOpts,
}

/// The `reset` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_reset(ui: &Ui, opts: &ResetOpts) -> Result<()> {
    let store = opts.store.job_store().await?;
    if opts.all_failed {
        let count = reset_all_failed(store, SCAN_PAGE_SIZE).await?;
        ui.display_message("🔁", &format!("Reset {count} failed documents"));
        return Ok(());
    }

    for id in &opts.document_ids {
        let document_id = DocumentId::new(id.as_str());
        match reset_failed(store.as_ref(), &document_id)
            .await
            .with_context(|| format!("failed to reset {document_id}"))?
        {
            UpdateOutcome::Applied(_) => {
                ui.display_message("🔁", &format!("{document_id}: reset to PENDING"));
            }
            UpdateOutcome::Skipped { current: None } => {
                warn!("{document_id}: no such document");
            }
            UpdateOutcome::Skipped {
                current: Some(status),
            } => {
                warn!("{document_id}: status is {status}, not failed; leaving it alone");
            }
        }
    }
    Ok(())
}

/// Count records by status.
async fn count_statuses(opts: &StatusOpts) -> Result<BTreeMap<JobStatus, usize>> {
    let store = opts.store.job_store().await?;
    let mut counts = JobStatus::ALL
        .into_iter()
        .map(|status| (status, 0))
        .collect::<BTreeMap<_, _>>();
    let mut pages = scan_pages(store, JobFilter::All, SCAN_PAGE_SIZE);
    while let Some(page) = pages.try_next().await.context("failed to scan job store")? {
        for record in page {
            *counts.entry(record.status).or_default() += 1;
        }
    }
    Ok(counts)
}

/// The `status` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_status(opts: &StatusOpts) -> Result<()> {
    let counts = count_statuses(opts).await?;
    let total: usize = counts.values().sum();
    for (status, count) in &counts {
        println!("{status:<15} {count}");
    }
    println!("{:<15} {total}", "TOTAL");
    Ok(())
}
