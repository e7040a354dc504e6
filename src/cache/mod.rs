//! Layer cache
//!
//! Maps a cache key (parent layer, instruction, input digest) to the layer a
//! build step produced. The cache is an explicit store handed to the builder;
//! nothing in strata keeps process-wide cache state.
//!
//! # Contract
//!
//! - Entries are immutable once published.
//! - Publishing is atomic: readers see a whole layer or nothing.
//! - Concurrent publishers of one key converge: the first wins and every
//!   later publisher gets the winning layer back.
//! - A successful publish is visible to the next lookup (read your writes).
//!
//! # Modes
//!
//! | Mode | Store | Lifetime |
//! |------|-------|----------|
//! | memory | [`MemoryCache`] | one process |
//! | disk | [`DiskCache`] | persistent, LRU-pruned |

pub mod disk;
pub mod memory;

pub use disk::DiskCache;
pub use memory::MemoryCache;

use crate::digest::Digest;
use crate::error::{StrataError, StrataResult};
use crate::layer::{Layer, LayerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Convert MB to bytes
pub fn mb_to_bytes(mb: u64) -> u64 {
    mb * 1024 * 1024
}

/// Where cache entries live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Memory,
    #[default]
    Disk,
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Disk => write!(f, "disk"),
        }
    }
}

impl std::str::FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "disk" => Ok(Self::Disk),
            other => Err(format!("unknown cache mode '{}' (memory, disk)", other)),
        }
    }
}

/// Cache key of one build step
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub parent: Option<LayerId>,
    pub instruction: String,
    pub input: Digest,
}

impl CacheKey {
    pub fn new(parent: Option<LayerId>, instruction: impl Into<String>, input: Digest) -> Self {
        Self {
            parent,
            instruction: instruction.into(),
            input,
        }
    }

    /// Digest of the key; equal to the id of the layer the step produces
    pub fn fingerprint(&self) -> LayerId {
        Layer::derive_id(self.parent.as_ref(), &self.instruction, &self.input)
    }
}

/// Listing entry for `strata cache list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryInfo {
    pub fingerprint: LayerId,
    pub created_by: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Outcome of a prune
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

/// Injectable layer cache
pub trait LayerCache: Send + Sync {
    /// Layer cached under `key`, if any
    fn lookup(&self, key: &CacheKey) -> StrataResult<Option<Arc<Layer>>>;

    /// Publish `layer` under `key` and return the entry that won
    fn publish(&self, key: &CacheKey, layer: Arc<Layer>) -> StrataResult<Arc<Layer>>;

    /// All entries, least recently used first
    fn entries(&self) -> StrataResult<Vec<CacheEntryInfo>>;

    /// Drop one entry
    fn remove(&self, fingerprint: &LayerId) -> StrataResult<bool>;

    /// Drop every entry, returning how many went
    fn clear(&self) -> StrataResult<usize>;

    /// Evict least recently used entries until the cache holds at most `max_bytes`
    fn prune(&self, max_bytes: u64) -> StrataResult<PruneReport>;
}

/// A layer may only be published under the key it was derived from
pub(crate) fn check_publish(key: &CacheKey, layer: &Layer) -> StrataResult<LayerId> {
    let fingerprint = key.fingerprint();
    if layer.id != fingerprint {
        return Err(StrataError::Cache(format!(
            "layer {} published under foreign key {}",
            layer.id.short(),
            fingerprint.short()
        )));
    }
    Ok(fingerprint)
}

/// Pick LRU victims so that the remaining entries fit in `max_bytes`.
/// `entries` must be ordered least recently used first.
pub(crate) fn plan_eviction(entries: &[CacheEntryInfo], max_bytes: u64) -> (Vec<LayerId>, PruneReport) {
    let mut total: u64 = entries.iter().map(|e| e.size_bytes).sum();
    let mut victims = Vec::new();
    let mut report = PruneReport::default();

    for entry in entries {
        if total <= max_bytes {
            break;
        }
        total -= entry.size_bytes;
        report.removed += 1;
        report.freed_bytes += entry.size_bytes;
        victims.push(entry.fingerprint.clone());
    }

    report.remaining_bytes = total;
    (victims, report)
}
