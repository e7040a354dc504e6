//! Before/after snapshots of a materialized root filesystem.
//!
//! A RunCommand step records a snapshot, runs the command, records another
//! and turns the difference into the new layer's delta.

use crate::digest::Digest;
use crate::error::{StrataError, StrataResult};
use crate::layer::delta::{mode_of, walk_tree, Entry, LayerDelta};
use crate::paths;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Fingerprint {
    File { mode: u32, size: u64, digest: Digest },
    Dir { mode: u32 },
    Symlink { target: String },
}

impl Fingerprint {
    fn is_dir(&self) -> bool {
        matches!(self, Self::Dir { .. })
    }
}

/// Content fingerprints of every path below a root
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<String, Fingerprint>,
}

impl Snapshot {
    /// Fingerprint every entry below `root`
    pub fn capture(root: &Path) -> StrataResult<Self> {
        let mut entries = BTreeMap::new();
        walk_tree(root, &mut |rel, host, meta| {
            let fingerprint = if meta.file_type().is_symlink() {
                let target = fs::read_link(host)
                    .map_err(|e| StrataError::io(format!("reading link {}", host.display()), e))?;
                Fingerprint::Symlink {
                    target: target.to_string_lossy().into_owned(),
                }
            } else if meta.is_dir() {
                Fingerprint::Dir {
                    mode: mode_of(meta),
                }
            } else {
                let content = fs::read(host)
                    .map_err(|e| StrataError::io(format!("reading {}", host.display()), e))?;
                Fingerprint::File {
                    mode: mode_of(meta),
                    size: content.len() as u64,
                    digest: Digest::of_bytes(&content),
                }
            };
            entries.insert(rel.to_string(), fingerprint);
            Ok(())
        })?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delta that turns `self` into `after`, reading changed content from `root`.
    ///
    /// Removed paths become whiteouts; a removed directory yields one whiteout
    /// for the directory, not one per child.
    pub fn diff(&self, after: &Snapshot, root: &Path) -> StrataResult<LayerDelta> {
        let mut delta = LayerDelta::new();

        for (path, fingerprint) in &after.entries {
            if self.entries.get(path) == Some(fingerprint) {
                continue;
            }
            let host = root.join(path);
            let meta = fs::symlink_metadata(&host)
                .map_err(|e| StrataError::io(format!("reading metadata of {}", host.display()), e))?;
            delta.insert(path.clone(), Entry::read(&host, &meta)?);
        }

        for path in self.entries.keys() {
            if after.entries.contains_key(path) {
                continue;
            }
            let parent = paths::parent(path);
            let parent_survives =
                parent.is_empty() || after.entries.get(parent).is_some_and(Fingerprint::is_dir);
            if parent_survives {
                delta.insert(path.clone(), Entry::Whiteout);
            }
        }

        Ok(delta)
    }
}
