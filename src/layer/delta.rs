//! Filesystem deltas
//!
//! A delta maps relative image paths to what a layer puts there. Deltas are
//! ordered by path so that digests and archives are deterministic.

use crate::digest::{Digest, DigestBuilder};
use crate::error::{StrataError, StrataResult};
use crate::paths;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Default mode for directories created implicitly
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// What a layer places at one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File { mode: u32, content: Arc<[u8]> },
    Dir { mode: u32 },
    Symlink { target: String },
    /// Deletes the path and everything below it
    Whiteout,
}

impl Entry {
    pub fn file(mode: u32, content: impl Into<Vec<u8>>) -> Self {
        Self::File {
            mode,
            content: Arc::from(content.into()),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir { .. })
    }

    fn kind_tag(&self) -> &'static str {
        match self {
            Self::File { .. } => "file",
            Self::Dir { .. } => "dir",
            Self::Symlink { .. } => "symlink",
            Self::Whiteout => "whiteout",
        }
    }

    /// Feed this entry into a digest
    pub(crate) fn hash_into(&self, path: &str, hasher: &mut DigestBuilder) {
        hasher.str_field(path).str_field(self.kind_tag());
        match self {
            Self::File { mode, content } => {
                hasher.field(&mode.to_le_bytes()).field(content);
            }
            Self::Dir { mode } => {
                hasher.field(&mode.to_le_bytes());
            }
            Self::Symlink { target } => {
                hasher.str_field(target);
            }
            Self::Whiteout => {}
        }
    }

    /// Read the entry at `host` from disk
    pub(crate) fn read(host: &Path, meta: &fs::Metadata) -> StrataResult<Self> {
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(host)
                .map_err(|e| StrataError::io(format!("reading link {}", host.display()), e))?;
            Ok(Self::Symlink {
                target: target.to_string_lossy().into_owned(),
            })
        } else if file_type.is_dir() {
            Ok(Self::Dir {
                mode: mode_of(meta),
            })
        } else {
            let content = fs::read(host)
                .map_err(|e| StrataError::io(format!("reading {}", host.display()), e))?;
            Ok(Self::file(mode_of(meta), content))
        }
    }
}

/// An ordered set of path entries produced by one layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerDelta {
    entries: BTreeMap<String, Entry>,
}

impl LayerDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: Entry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes of file content
    pub fn size_bytes(&self) -> u64 {
        self.entries
            .values()
            .map(|e| match e {
                Entry::File { content, .. } => content.len() as u64,
                _ => 0,
            })
            .sum()
    }

    /// Content digest over every entry in path order
    pub fn digest(&self) -> Digest {
        let mut hasher = DigestBuilder::new();
        for (path, entry) in &self.entries {
            entry.hash_into(path, &mut hasher);
        }
        hasher.finish()
    }

    /// Move every entry below the relative directory `dest`
    pub fn rebase(self, dest: &str) -> Self {
        if dest.is_empty() {
            return self;
        }
        let entries = self
            .entries
            .into_iter()
            .map(|(path, entry)| (paths::join(dest, &path), entry))
            .collect();
        Self { entries }
    }

    /// Read a whole directory tree as a delta
    pub fn capture_dir(root: &Path) -> StrataResult<Self> {
        let mut delta = Self::new();
        walk_tree(root, &mut |rel, host, meta| {
            delta.insert(rel, Entry::read(host, meta)?);
            Ok(())
        })?;
        Ok(delta)
    }
}

impl FromIterator<(String, Entry)> for LayerDelta {
    fn from_iter<I: IntoIterator<Item = (String, Entry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Permission bits of a file
#[cfg(unix)]
pub(crate) fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn mode_of(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        DEFAULT_DIR_MODE
    } else {
        0o644
    }
}

/// Walk `root` in sorted order without following symlinks, calling `visit`
/// with the relative path, host path and metadata of every entry.
pub(crate) fn walk_tree(
    root: &Path,
    visit: &mut dyn FnMut(&str, &Path, &fs::Metadata) -> StrataResult<()>,
) -> StrataResult<()> {
    walk_inner(root, "", visit)
}

fn walk_inner(
    dir: &Path,
    rel_dir: &str,
    visit: &mut dyn FnMut(&str, &Path, &fs::Metadata) -> StrataResult<()>,
) -> StrataResult<()> {
    let read_dir = fs::read_dir(dir)
        .map_err(|e| StrataError::io(format!("reading directory {}", dir.display()), e))?;

    let mut children = Vec::new();
    for entry in read_dir {
        let entry =
            entry.map_err(|e| StrataError::io(format!("reading entry in {}", dir.display()), e))?;
        children.push(entry);
    }
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let name = child.file_name().to_string_lossy().into_owned();
        let rel = paths::join(rel_dir, &name);
        let host = child.path();
        let meta = fs::symlink_metadata(&host)
            .map_err(|e| StrataError::io(format!("reading metadata of {}", host.display()), e))?;

        visit(&rel, &host, &meta)?;

        if meta.is_dir() {
            walk_inner(&host, &rel, visit)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn digest_is_order_independent_of_insertion() {
        let mut a = LayerDelta::new();
        a.insert("b.txt", Entry::file(0o644, "b"));
        a.insert("a.txt", Entry::file(0o644, "a"));

        let mut b = LayerDelta::new();
        b.insert("a.txt", Entry::file(0o644, "a"));
        b.insert("b.txt", Entry::file(0o644, "b"));

        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn digest_sees_mode_changes() {
        let mut a = LayerDelta::new();
        a.insert("run.sh", Entry::file(0o644, "echo"));
        let mut b = LayerDelta::new();
        b.insert("run.sh", Entry::file(0o755, "echo"));
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn rebase_moves_entries() {
        let mut delta = LayerDelta::new();
        delta.insert("manifest", Entry::file(0o644, "deps"));
        let moved = delta.rebase("app");
        assert!(moved.get("app/manifest").is_some());
        assert!(moved.get("manifest").is_none());
    }

    #[test]
    fn capture_dir_reads_tree() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/os-release"), "ID=test").unwrap();

        let delta = LayerDelta::capture_dir(dir.path()).unwrap();
        assert!(delta.get("etc").unwrap().is_dir());
        match delta.get("etc/os-release").unwrap() {
            Entry::File { content, .. } => assert_eq!(&content[..], b"ID=test"),
            other => panic!("unexpected entry {:?}", other),
        }
        assert_eq!(delta.size_bytes(), 7);
    }
}
