//! Cache command - inspect and bound the layer cache

use crate::cache::{format_bytes, mb_to_bytes, CacheEntryInfo, CacheMode, DiskCache, LayerCache};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::{Config, DataDirs};
use crate::error::StrataResult;
use crate::ui::{self, TaskSpinner, UiContext};
use console::style;
use tracing::debug;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config, dirs: &DataDirs) -> StrataResult<()> {
    let ctx = UiContext::detect();
    if config.cache.mode == CacheMode::Memory {
        ui::remark(
            &ctx,
            "cache.mode is memory; these commands act on the on-disk cache",
        );
    }
    let cache = DiskCache::open(dirs.cache())?;

    match args.action {
        CacheAction::List { format } => list_entries(&ctx, &cache, format),
        CacheAction::Prune { max_size_mb } => {
            let max_mb = max_size_mb.unwrap_or(config.cache.max_size_mb);
            prune(&ctx, &cache, max_mb)
        }
        CacheAction::Clear { yes } => clear(ctx.with_auto_yes(yes), &cache).await,
    }
}

fn list_entries(ctx: &UiContext, cache: &DiskCache, format: OutputFormat) -> StrataResult<()> {
    let entries = cache.entries()?;

    if entries.is_empty() {
        match format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => ui::step_info(ctx, "Layer cache is empty"),
        }
        return Ok(());
    }

    match format {
        OutputFormat::Table => {
            ui::intro(ctx, "Layer cache");
            print_table(&entries);
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}", entry.fingerprint);
            }
        }
    }
    Ok(())
}

fn print_table(entries: &[CacheEntryInfo]) {
    println!(
        "{:<14} {:<10} {:<17} {:<40}",
        style("LAYER").bold(),
        style("SIZE").bold(),
        style("LAST USED").bold(),
        style("CREATED BY").bold()
    );
    println!("{}", "-".repeat(84));

    for entry in entries {
        println!(
            "{:<14} {:<10} {:<17} {:<40}",
            entry.fingerprint.short(),
            format_bytes(entry.size_bytes),
            entry.last_used.format("%Y-%m-%d %H:%M"),
            ui::truncate(&entry.created_by, 40)
        );
    }

    let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
    println!();
    println!("Total: {} entries, {}", entries.len(), format_bytes(total));
}

fn prune(ctx: &UiContext, cache: &DiskCache, max_mb: u64) -> StrataResult<()> {
    let mut spinner = TaskSpinner::new(ctx);
    spinner.start(&format!("Pruning cache to {} MB...", max_mb));
    let report = match cache.prune(mb_to_bytes(max_mb)) {
        Ok(report) => report,
        Err(e) => {
            spinner.stop_error("Prune failed");
            return Err(e);
        }
    };
    debug!("Prune report: {:?}", report);

    if report.removed == 0 {
        spinner.stop(&format!(
            "Nothing to prune ({} in use)",
            format_bytes(report.remaining_bytes)
        ));
    } else {
        spinner.stop(&format!(
            "Removed {} entries, freed {} ({} remaining)",
            report.removed,
            format_bytes(report.freed_bytes),
            format_bytes(report.remaining_bytes)
        ));
    }
    Ok(())
}

async fn clear(ctx: UiContext, cache: &DiskCache) -> StrataResult<()> {
    let entries = cache.entries()?;
    if entries.is_empty() {
        ui::step_info(&ctx, "Layer cache is already empty");
        return Ok(());
    }

    let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
    let prompt = format!(
        "Remove {} cache entries ({})?",
        entries.len(),
        format_bytes(total)
    );
    if !ui::confirm(&ctx, &prompt, false).await? {
        ui::step_warn(&ctx, "Aborted");
        return Ok(());
    }

    let removed = cache.clear()?;
    ui::step_ok(&ctx, &format!("Cleared {} cache entries", removed));
    Ok(())
}
