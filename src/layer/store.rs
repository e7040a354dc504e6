//! On-disk layer store
//!
//! Layout:
//!
//! ```text
//! <root>/blobs/<diff-digest>.tar    deterministic delta archive
//! <root>/layers/<layer-id>.json     layer record, written last
//! ```
//!
//! Blobs are content-addressed by the delta digest, so two writers of the
//! same blob write the same bytes. A layer only exists once its record is in
//! place; the record is published with no-clobber semantics, which makes the
//! first writer of a layer id the winner.

use crate::digest::Digest;
use crate::error::{StrataError, StrataResult};
use crate::layer::{archive, Layer, LayerId, LayerRecord};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Directory of layer archives and records
#[derive(Debug, Clone)]
pub struct LayerStore {
    root: PathBuf,
}

impl LayerStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> StrataResult<Self> {
        let root = root.into();
        for dir in [root.join("blobs"), root.join("layers")] {
            fs::create_dir_all(&dir)
                .map_err(|e| StrataError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, diff: &Digest) -> PathBuf {
        self.root.join("blobs").join(format!("{}.tar", diff.hex()))
    }

    fn record_path(&self, id: &LayerId) -> PathBuf {
        self.root.join("layers").join(format!("{}.json", id.hex()))
    }

    pub fn contains(&self, id: &LayerId) -> bool {
        self.record_path(id).is_file()
    }

    /// Store `layer`. Returns `false` if a layer with the same id was already
    /// committed, in which case the stored one is left untouched.
    pub fn put(&self, layer: &Layer) -> StrataResult<bool> {
        if self.contains(&layer.id) {
            return Ok(false);
        }

        self.put_archive(layer)?;

        let mut tmp = self.temp_file()?;
        serde_json::to_writer_pretty(&mut tmp, &layer.record())?;
        tmp.flush()
            .map_err(|e| StrataError::io("writing layer record", e))?;

        let record = self.record_path(&layer.id);
        match tmp.persist_noclobber(&record) {
            Ok(_) => {
                debug!("Stored layer {} ({} entries)", layer.id.short(), layer.delta.len());
                Ok(true)
            }
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("Layer {} already stored by another writer", layer.id.short());
                Ok(false)
            }
            Err(e) => Err(StrataError::io(
                format!("publishing {}", record.display()),
                e.error,
            )),
        }
    }

    /// Write the delta archive of `layer` unless one with its diff digest exists
    pub fn put_archive(&self, layer: &Layer) -> StrataResult<()> {
        let blob = self.blob_path(&layer.diff_digest);
        if blob.is_file() {
            return Ok(());
        }
        let tmp = self.temp_file()?;
        let writer = archive::write_delta(&layer.delta, BufWriter::new(tmp))?;
        let tmp = writer
            .into_inner()
            .map_err(|e| StrataError::io("flushing layer archive", e.into_error()))?;
        tmp.persist(&blob)
            .map_err(|e| StrataError::io(format!("publishing {}", blob.display()), e.error))?;
        Ok(())
    }

    /// Rebuild the layer described by `record` from its archive
    pub fn load(&self, record: LayerRecord) -> StrataResult<Layer> {
        let blob = self.blob_path(&record.diff_digest);
        let file = fs::File::open(&blob).map_err(|e| StrataError::LayerCorrupt {
            id: record.id.to_string(),
            reason: format!("missing archive {}: {}", blob.display(), e),
        })?;
        let delta = archive::read_delta(BufReader::new(file), record.id.as_str())?;
        Layer::from_record(record, delta)
    }

    /// Delete the archive with diff digest `diff`, if present
    pub fn remove_archive(&self, diff: &Digest) {
        let blob = self.blob_path(diff);
        match fs::remove_file(&blob) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", blob.display(), e),
        }
    }

    /// Read a layer record without loading its archive
    pub fn record(&self, id: &LayerId) -> StrataResult<LayerRecord> {
        let path = self.record_path(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StrataError::LayerNotFound(id.to_string()))
            }
            Err(e) => return Err(StrataError::io(format!("reading {}", path.display()), e)),
        };
        serde_json::from_str(&content).map_err(|e| StrataError::LayerCorrupt {
            id: id.to_string(),
            reason: format!("bad record: {}", e),
        })
    }

    /// Load a full layer
    pub fn get(&self, id: &LayerId) -> StrataResult<Layer> {
        let record = self.record(id)?;
        self.load(record)
    }

    /// All committed layer records
    pub fn records(&self) -> StrataResult<Vec<LayerRecord>> {
        let dir = self.root.join("layers");
        let read_dir = fs::read_dir(&dir)
            .map_err(|e| StrataError::io(format!("reading {}", dir.display()), e))?;

        let mut records = Vec::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<LayerRecord>(&c).ok())
            {
                Some(record) => records.push(record),
                None => warn!("Skipping unreadable layer record {}", path.display()),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Remove a layer; its archive goes too unless another layer shares it
    pub fn remove(&self, id: &LayerId) -> StrataResult<bool> {
        let record = match self.record(id) {
            Ok(record) => record,
            Err(StrataError::LayerNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let path = self.record_path(id);
        fs::remove_file(&path)
            .map_err(|e| StrataError::io(format!("removing {}", path.display()), e))?;

        let shared = self
            .records()?
            .iter()
            .any(|r| r.diff_digest == record.diff_digest);
        if !shared {
            self.remove_archive(&record.diff_digest);
        }
        Ok(true)
    }

    /// Total size of stored archives
    pub fn disk_usage(&self) -> u64 {
        fs::read_dir(self.root.join("blobs"))
            .map(|rd| {
                rd.flatten()
                    .filter_map(|e| e.metadata().ok())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0)
    }

    fn temp_file(&self) -> StrataResult<NamedTempFile> {
        NamedTempFile::new_in(&self.root)
            .map_err(|e| StrataError::io(format!("creating temp file in {}", self.root.display()), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::delta::{Entry, LayerDelta};
    use tempfile::TempDir;

    fn layer(content: &str) -> Layer {
        let mut delta = LayerDelta::new();
        delta.insert("app/main.py", Entry::file(0o644, content));
        Layer::new(
            None,
            "COPY . /app".to_string(),
            Digest::of_bytes(content.as_bytes()),
            delta,
        )
    }

    #[test]
    fn put_then_get() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::open(dir.path()).unwrap();
        let original = layer("print(1)");

        assert!(store.put(&original).unwrap());
        let loaded = store.get(&original.id).unwrap();

        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.delta, original.delta);
        assert_eq!(loaded.created_by, "COPY . /app");
    }

    #[test]
    fn first_writer_wins() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::open(dir.path()).unwrap();
        let first = layer("print(1)");
        assert!(store.put(&first).unwrap());
        assert!(!store.put(&first).unwrap());
        assert_eq!(store.records().unwrap().len(), 1);
    }

    #[test]
    fn missing_layer_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::open(dir.path()).unwrap();
        let err = store.get(&layer("x").id).unwrap_err();
        assert!(matches!(err, StrataError::LayerNotFound(_)));
    }

    #[test]
    fn remove_deletes_record_and_blob() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::open(dir.path()).unwrap();
        let l = layer("bye");
        store.put(&l).unwrap();

        assert!(store.remove(&l.id).unwrap());
        assert!(!store.contains(&l.id));
        assert_eq!(store.disk_usage(), 0);
        assert!(!store.remove(&l.id).unwrap());
    }
}
