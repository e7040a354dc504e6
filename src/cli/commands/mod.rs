//! CLI command implementations

pub mod build;
pub mod cache;
pub mod config;
pub mod images;
pub mod run;

pub use build::execute as build;
pub use cache::execute as cache;
pub use config::execute as config;
pub use images::{inspect, list as images, remove as rmi, tag};
pub use run::execute as run;

use crate::cache::disk::DiskCache;
use crate::cache::memory::MemoryCache;
use crate::cache::{CacheMode, LayerCache};
use crate::config::{Config, DataDirs};
use crate::error::{StrataError, StrataResult};
use crate::image::ImageStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Open the layer cache selected by `cache.mode`
pub(crate) fn open_cache(config: &Config, dirs: &DataDirs) -> StrataResult<Arc<dyn LayerCache>> {
    debug!("Using {} layer cache", config.cache.mode);
    Ok(match config.cache.mode {
        CacheMode::Memory => Arc::new(MemoryCache::new()),
        CacheMode::Disk => Arc::new(DiskCache::open(dirs.cache())?),
    })
}

pub(crate) fn open_images(dirs: &DataDirs) -> StrataResult<ImageStore> {
    ImageStore::open(dirs.images())
}

pub(crate) fn current_dir() -> StrataResult<PathBuf> {
    std::env::current_dir().map_err(|e| StrataError::io("getting current directory", e))
}
