//! Build command - turn a build context into an image

use crate::base::{list_available_bases, BaseRef, DirectoryBaseProvider};
use crate::builder::{BuildOutcome, Builder};
use crate::cli::args::BuildArgs;
use crate::cli::commands::{current_dir, open_cache, open_images};
use crate::config::{Config, DataDirs};
use crate::descriptor::BuildDescriptor;
use crate::error::{StrataError, StrataResult};
use crate::ui::{self, BuildProgress, UiContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config, dirs: &DataDirs) -> StrataResult<()> {
    let ctx = UiContext::detect();

    let context_dir = match args.context {
        Some(dir) => dir,
        None => current_dir()?,
    };
    let context_dir = context_dir
        .canonicalize()
        .map_err(|_| StrataError::PathNotFound(context_dir.clone()))?;
    let descriptor_path = args
        .file
        .unwrap_or_else(|| context_dir.join(&config.build.descriptor));

    let tags = args
        .tag
        .iter()
        .map(|tag| parse_tag(tag))
        .collect::<StrataResult<Vec<_>>>()?;

    let descriptor = BuildDescriptor::from_file(&descriptor_path).await?;
    debug!(
        "Loaded {} with {} instructions",
        descriptor_path.display(),
        descriptor.len()
    );

    let images = Arc::new(open_images(dirs)?);
    let search_dirs = base_search_dirs(config, dirs);
    let mut bases = DirectoryBaseProvider::new()
        .with_project_dir(&context_dir)
        .with_images(Arc::clone(&images));
    for dir in &search_dirs {
        bases = bases.with_search_dir(dir);
    }

    let mut env = config.build.env.clone();
    env.extend(args.build_env);

    let mut builder = Builder::new(Arc::new(bases))
        .with_isolation(config.build.isolation)
        .with_env(env)
        .with_work_dir(dirs.tmp());
    if config.cache.enabled && !args.no_cache {
        builder = builder.with_cache(open_cache(config, dirs)?);
    }

    let result = if args.quiet {
        builder.build(&descriptor, &context_dir).await
    } else {
        let progress = BuildProgress::new(&ctx, &context_label(&context_dir));
        let result = builder
            .build_with_progress(&descriptor, &context_dir, &|event| progress.on_event(event))
            .await;
        progress.finish();
        result
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if matches!(e.cause(), StrataError::BaseResolution { .. }) {
                print_available_bases(&ctx, &context_dir, &search_dirs).await;
            }
            return Err(e);
        }
    };

    images.save(&outcome.image, &tags)?;

    if args.quiet {
        println!("{}", outcome.image.id);
    } else {
        print_summary(&ctx, &outcome, &tags);
    }

    Ok(())
}

fn parse_tag(tag: &str) -> StrataResult<BaseRef> {
    let reference = BaseRef::parse(tag)
        .map_err(|_| StrataError::User(format!("Invalid tag '{}', expected name[:tag]", tag)))?;
    if reference.is_scratch() {
        return Err(StrataError::User("'scratch' is reserved".to_string()));
    }
    Ok(reference)
}

fn base_search_dirs(config: &Config, dirs: &DataDirs) -> Vec<PathBuf> {
    let mut search = config.build.base_dirs.clone();
    search.push(dirs.bases());
    search
}

fn context_label(context_dir: &Path) -> String {
    context_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| context_dir.display().to_string())
}

async fn print_available_bases(ctx: &UiContext, context_dir: &Path, search_dirs: &[PathBuf]) {
    let available = list_available_bases(Some(context_dir), search_dirs).await;
    if available.is_empty() {
        ui::remark(ctx, "No base snapshots found; FROM scratch always works");
        return;
    }
    ui::remark(ctx, "Available bases:");
    for base in available {
        eprintln!("    {} ({})", base.reference, base.source);
    }
}

fn print_summary(ctx: &UiContext, outcome: &BuildOutcome, tags: &[BaseRef]) {
    let image = &outcome.image;
    ui::step_ok_detail(
        ctx,
        &format!("Built image {}", image.id.short()),
        &format!(
            "{} layers, {} cached, {} built",
            image.chain.len(),
            outcome.cache_hits(),
            outcome.built()
        ),
    );
    for tag in tags {
        ui::step_info(ctx, &format!("Tagged {}", tag));
    }
    println!("{}", image.id);
}
