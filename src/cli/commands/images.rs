//! Image commands - list, inspect, remove and tag local images

use crate::base::BaseRef;
use crate::cache::format_bytes;
use crate::cli::args::{ImagesArgs, InspectArgs, OutputFormat, RmiArgs, TagArgs};
use crate::cli::commands::open_images;
use crate::config::{Config, DataDirs};
use crate::error::{StrataError, StrataResult};
use crate::image::{ImageConfig, ImageId, ImageSummary};
use crate::layer::LayerRecord;
use crate::ui::{self, UiContext};
use chrono::{DateTime, Utc};
use console::style;
use serde::Serialize;

/// Execute the images command
pub async fn list(args: ImagesArgs, _config: &Config, dirs: &DataDirs) -> StrataResult<()> {
    let ctx = UiContext::detect();
    let images = open_images(dirs)?.list()?;

    if images.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => ui::step_info(&ctx, "No images"),
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => {
            ui::intro(&ctx, "Images");
            print_table(&images);
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&images)?),
        OutputFormat::Plain => {
            for image in &images {
                println!("{}", image.id);
            }
        }
    }

    Ok(())
}

fn print_table(images: &[ImageSummary]) {
    println!(
        "{:<14} {:<30} {:<8} {:<10} {:<17}",
        style("IMAGE ID").bold(),
        style("TAGS").bold(),
        style("LAYERS").bold(),
        style("SIZE").bold(),
        style("CREATED").bold()
    );
    println!("{}", "-".repeat(83));

    for image in images {
        let tags = if image.tags.is_empty() {
            style("<none>".to_string()).dim()
        } else {
            style(image.tags.join(", "))
        };
        println!(
            "{:<14} {:<30} {:<8} {:<10} {:<17}",
            image.id.short(),
            tags,
            image.layers,
            format_bytes(image.size_bytes),
            image.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("{} image(s)", images.len());
}

#[derive(Serialize)]
struct ImageDetails {
    id: ImageId,
    tags: Vec<String>,
    config: ImageConfig,
    size_bytes: u64,
    created_at: DateTime<Utc>,
    layers: Vec<LayerRecord>,
}

/// Execute the inspect command
pub async fn inspect(args: InspectArgs, _config: &Config, dirs: &DataDirs) -> StrataResult<()> {
    let store = open_images(dirs)?;
    let image = store.get(&args.image)?;
    let tags = store
        .list()?
        .into_iter()
        .find(|summary| summary.id == image.id)
        .map(|summary| summary.tags)
        .unwrap_or_default();

    let details = ImageDetails {
        size_bytes: image.size_bytes(),
        layers: image.chain.layers().iter().map(|l| l.record()).collect(),
        id: image.id,
        tags,
        config: image.config,
        created_at: image.created_at,
    };
    println!("{}", serde_json::to_string_pretty(&details)?);
    Ok(())
}

/// Execute the rmi command
pub async fn remove(args: RmiArgs, _config: &Config, dirs: &DataDirs) -> StrataResult<()> {
    let ctx = UiContext::detect();
    let id = open_images(dirs)?.remove(&args.image)?;
    ui::step_ok(&ctx, &format!("Removed image {}", id.short()));
    Ok(())
}

/// Execute the tag command
pub async fn tag(args: TagArgs, _config: &Config, dirs: &DataDirs) -> StrataResult<()> {
    let ctx = UiContext::detect();
    let tag = BaseRef::parse(&args.tag)
        .map_err(|_| StrataError::User(format!("Invalid tag '{}', expected name[:tag]", args.tag)))?;
    if tag.is_scratch() {
        return Err(StrataError::User("'scratch' is reserved".to_string()));
    }

    let store = open_images(dirs)?;
    let id = store.resolve(&args.image)?;
    store.set_tag(&tag, &id)?;
    ui::step_ok(&ctx, &format!("Tagged {} as {}", id.short(), tag));
    Ok(())
}
