//! Persistent layer cache
//!
//! ```text
//! <root>/layers/...               LayerStore holding cached layers
//! <root>/entries/<key>.json       usage record per cache key
//! ```
//!
//! The layer store decides publish races (first committed record wins); the
//! usage record only carries timestamps for LRU pruning.

use crate::cache::{check_publish, plan_eviction, CacheEntryInfo, CacheKey, LayerCache, PruneReport};
use crate::error::{StrataError, StrataResult};
use crate::layer::{Layer, LayerId, LayerStore};
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Cache persisted below a directory
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    store: LayerStore,
}

impl DiskCache {
    /// Open (and create if needed) a cache at `root`
    pub fn open(root: impl Into<PathBuf>) -> StrataResult<Self> {
        let root = root.into();
        let entries = root.join("entries");
        fs::create_dir_all(&entries)
            .map_err(|e| StrataError::io(format!("creating {}", entries.display()), e))?;
        let store = LayerStore::open(root.join("layers"))?;
        Ok(Self { root, store })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bytes used by cached archives
    pub fn disk_usage(&self) -> u64 {
        self.store.disk_usage()
    }

    fn entry_path(&self, fingerprint: &LayerId) -> PathBuf {
        self.root
            .join("entries")
            .join(format!("{}.json", fingerprint.hex()))
    }

    fn read_entry(&self, fingerprint: &LayerId) -> StrataResult<Option<CacheEntryInfo>> {
        let path = self.entry_path(fingerprint);
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(info) => Ok(Some(info)),
                Err(e) => {
                    warn!("Ignoring unreadable cache entry {}: {}", path.display(), e);
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StrataError::io(format!("reading {}", path.display()), e)),
        }
    }

    fn write_entry(&self, info: &CacheEntryInfo, overwrite: bool) -> StrataResult<()> {
        let path = self.entry_path(&info.fingerprint);
        let mut tmp = NamedTempFile::new_in(self.root.join("entries"))
            .map_err(|e| StrataError::io("creating cache entry", e))?;
        serde_json::to_writer_pretty(&mut tmp, info)?;
        tmp.flush()
            .map_err(|e| StrataError::io("writing cache entry", e))?;

        let result = if overwrite {
            tmp.persist(&path).map(|_| ())
        } else {
            tmp.persist_noclobber(&path).map(|_| ())
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if !overwrite && e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(StrataError::io(format!("publishing {}", path.display()), e.error)),
        }
    }
}

impl LayerCache for DiskCache {
    fn lookup(&self, key: &CacheKey) -> StrataResult<Option<Arc<Layer>>> {
        let fingerprint = key.fingerprint();
        let Some(mut entry) = self.read_entry(&fingerprint)? else {
            debug!("Disk cache miss for {}", fingerprint.short());
            return Ok(None);
        };

        let layer = match self.store.get(&fingerprint) {
            Ok(layer) => layer,
            Err(StrataError::LayerNotFound(_)) => {
                warn!("Cache entry {} has no layer; treating as miss", fingerprint.short());
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        entry.last_used = Utc::now();
        if let Err(e) = self.write_entry(&entry, true) {
            warn!("Failed to refresh cache entry {}: {}", fingerprint.short(), e);
        }

        debug!("Disk cache hit for {}", fingerprint.short());
        Ok(Some(Arc::new(layer)))
    }

    fn publish(&self, key: &CacheKey, layer: Arc<Layer>) -> StrataResult<Arc<Layer>> {
        let fingerprint = check_publish(key, &layer)?;

        let winner = if self.store.put(&layer)? {
            info!("Cached layer {} ({})", layer.id.short(), layer.created_by);
            layer
        } else {
            Arc::new(self.store.get(&fingerprint)?)
        };

        let now = Utc::now();
        self.write_entry(
            &CacheEntryInfo {
                fingerprint,
                created_by: winner.created_by.clone(),
                size_bytes: winner.size_bytes(),
                created_at: winner.created_at,
                last_used: now,
            },
            false,
        )?;

        Ok(winner)
    }

    fn entries(&self) -> StrataResult<Vec<CacheEntryInfo>> {
        let dir = self.root.join("entries");
        let read_dir =
            fs::read_dir(&dir).map_err(|e| StrataError::io(format!("reading {}", dir.display()), e))?;

        let mut entries = Vec::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<CacheEntryInfo>(&c).ok())
            {
                Some(info) => entries.push(info),
                None => warn!("Skipping unreadable cache entry {}", path.display()),
            }
        }
        entries.sort_by(|a, b| a.last_used.cmp(&b.last_used));
        Ok(entries)
    }

    fn remove(&self, fingerprint: &LayerId) -> StrataResult<bool> {
        let path = self.entry_path(fingerprint);
        let had_entry = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(StrataError::io(format!("removing {}", path.display()), e)),
        };
        let had_layer = self.store.remove(fingerprint)?;
        Ok(had_entry || had_layer)
    }

    fn clear(&self) -> StrataResult<usize> {
        let entries = self.entries()?;
        let count = entries.len();
        for entry in entries {
            self.remove(&entry.fingerprint)?;
        }
        // Layers whose usage record was lost
        for record in self.store.records()? {
            self.store.remove(&record.id)?;
        }
        info!("Cleared {} cache entries", count);
        Ok(count)
    }

    fn prune(&self, max_bytes: u64) -> StrataResult<PruneReport> {
        let entries = self.entries()?;
        let (victims, report) = plan_eviction(&entries, max_bytes);
        for victim in &victims {
            self.remove(victim)?;
        }
        if report.removed > 0 {
            info!(
                "Pruned {} cache entries ({} bytes)",
                report.removed, report.freed_bytes
            );
        }
        Ok(report)
    }
}
