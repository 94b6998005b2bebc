use std::path::Path;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::error::InquireResult;

use crate::{
    app::{AppContext, AppFactory, AppPaths},
    similarity::{identifier, CancelFlag, SyncProgress, SyncReport, VectorStore},
    web,
};

/// How many delta names a dry run prints before summarizing
const DRY_RUN_LISTING: usize = 20;

pub fn sync(app: &AppContext, batch_size: Option<usize>, dry_run: bool) -> Result<()> {
    if dry_run {
        let plan = app.plan_sync()?;
        println!(
            "{} listed, {} already indexed, {} to embed",
            plan.listed,
            plan.already_indexed,
            plan.delta.len()
        );
        for item in plan.delta.iter().take(DRY_RUN_LISTING) {
            println!("  {}", item.name);
        }
        if plan.delta.len() > DRY_RUN_LISTING {
            println!("  ... and {} more", plan.delta.len() - DRY_RUN_LISTING);
        }
        return Ok(());
    }

    let report = run_sync(app, batch_size)?;
    print_report(&report);
    Ok(())
}

/// A cancel flag raised by Ctrl+C.
fn interruptible() -> CancelFlag {
    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        log::warn!("interrupted, finishing the current batch");
        handler_flag.cancel();
    }) {
        log::warn!("Ctrl+C handler not installed: {err}");
    }
    cancel
}

/// Sync with a progress bar; Ctrl+C stops after the current batch.
fn run_sync(app: &AppContext, batch_size: Option<usize>) -> Result<SyncReport> {
    run_sync_with(app, batch_size, interruptible())
}

fn run_sync_with(
    app: &AppContext,
    batch_size: Option<usize>,
    cancel: CancelFlag,
) -> Result<SyncReport> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta}] {msg}")?
            .progress_chars("##-"),
    );

    let report = app.sync(batch_size, cancel, &mut |progress: &SyncProgress| {
        bar.set_length(progress.total as u64);
        bar.set_position(progress.processed as u64);
        bar.set_message(format!("{} skipped", progress.skipped));
    });
    bar.finish_and_clear();

    Ok(report?)
}

/// Sync before serving. Returns `false` when the sync was interrupted, in
/// which case the server is not started.
pub(crate) fn startup_sync(app: &AppContext, cancel: CancelFlag) -> Result<bool> {
    let report = run_sync_with(app, None, cancel)?;
    print_report(&report);
    if report.cancelled {
        log::warn!("startup sync interrupted, not starting the server");
        return Ok(false);
    }
    Ok(true)
}

fn print_report(report: &SyncReport) {
    println!(
        "{} listed, {} already indexed, {} embedded, {} skipped{}",
        report.listed,
        report.already_indexed,
        report.embedded,
        report.skipped.len(),
        if report.cancelled { " (cancelled)" } else { "" }
    );
    for skipped in &report.skipped {
        println!("  skipped {}: {}", skipped.item.name, skipped.reason);
    }
}

pub fn search(app: &AppContext, image: &Path, k: Option<usize>) -> Result<()> {
    let bytes =
        std::fs::read(image).with_context(|| format!("Failed to read {}", image.display()))?;
    let results = app.search(&bytes, k)?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

pub fn serve(app: AppContext, no_sync: bool, listen: Option<String>) -> Result<()> {
    if !no_sync && !startup_sync(&app, interruptible())? {
        return Ok(());
    }

    let listen_addr = listen.unwrap_or_else(|| app.config().listen_addr.clone());
    web::start_daemon(app, &listen_addr)
}

pub fn status(app: &AppContext) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&app.status()?)?);
    Ok(())
}

pub fn id(name: &str) {
    println!("{}", identifier(name));
}

pub fn prune(app: &AppContext, yes: bool) -> Result<()> {
    let stale = app.stale_entries()?;
    if stale.is_empty() {
        println!("Nothing to prune");
        return Ok(());
    }

    for (_, name) in &stale {
        println!("  {name}");
    }

    if !yes && !confirm(&format!("Remove {} entries from the index?", stale.len()))? {
        return Ok(());
    }

    let removed = app.prune(&stale)?;
    println!("{removed} entries removed");
    Ok(())
}

pub fn reindex(paths: &AppPaths, yes: bool, batch_size: Option<usize>) -> Result<()> {
    if !yes && !confirm("This drops every stored embedding and recomputes them. Continue?")? {
        return Ok(());
    }

    VectorStore::discard(&paths.base_path)
        .context("Failed to discard index (is another process syncing?)")?;

    let app = AppFactory::build_context(paths)?;
    let report = run_sync(&app, batch_size)?;
    print_report(&report);
    Ok(())
}

fn confirm(message: &str) -> Result<bool> {
    match inquire::prompt_confirmation(message) {
        InquireResult::Ok(answer) => Ok(answer),
        InquireResult::Err(err) => bail!("An error occurred: {}", err),
    }
}
