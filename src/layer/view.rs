//! Unified view over a layer stack.
//!
//! Folding deltas bottom to top gives the filesystem a container sees: later
//! layers shadow earlier ones at the same path, whiteouts delete.

use crate::digest::{Digest, DigestBuilder};
use crate::error::{StrataError, StrataResult};
use crate::layer::delta::{Entry, LayerDelta, DEFAULT_DIR_MODE};
use crate::paths;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Flattened filesystem of a layer stack
#[derive(Debug, Clone, Default)]
pub struct UnifiedView {
    entries: BTreeMap<String, Entry>,
}

impl UnifiedView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold deltas in stack order (base first)
    pub fn from_deltas<'a>(deltas: impl IntoIterator<Item = &'a LayerDelta>) -> Self {
        let mut view = Self::new();
        for delta in deltas {
            view.apply(delta);
        }
        view
    }

    /// Overlay one delta on top of the view
    pub fn apply(&mut self, delta: &LayerDelta) {
        for (path, entry) in delta.entries() {
            match entry {
                Entry::Whiteout => {
                    self.entries.remove(path);
                    self.remove_descendants(path);
                }
                Entry::Dir { .. } => {
                    self.ensure_parent_dirs(path);
                    let replaces_dir = self.entries.get(path).is_some_and(Entry::is_dir);
                    if !replaces_dir {
                        self.remove_descendants(path);
                    }
                    self.entries.insert(path.clone(), entry.clone());
                }
                Entry::File { .. } | Entry::Symlink { .. } => {
                    self.ensure_parent_dirs(path);
                    self.remove_descendants(path);
                    self.entries.insert(path.clone(), entry.clone());
                }
            }
        }
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

    /// Content digest of the flattened filesystem
    pub fn digest(&self) -> Digest {
        let mut hasher = DigestBuilder::new();
        for (path, entry) in &self.entries {
            entry.hash_into(path, &mut hasher);
        }
        hasher.finish()
    }

    /// Flatten into a single delta
    pub fn into_delta(self) -> LayerDelta {
        self.entries.into_iter().collect()
    }

    /// Write the view below `root`, creating it if needed; `root` must be empty
    pub fn materialize(&self, root: &Path) -> StrataResult<()> {
        fs::create_dir_all(root)
            .map_err(|e| StrataError::io(format!("creating directory {}", root.display()), e))?;
        let mut dir_modes = Vec::new();

        for (path, entry) in &self.entries {
            let host = root.join(path);
            match entry {
                Entry::Dir { mode } => {
                    fs::create_dir_all(&host).map_err(|e| {
                        StrataError::io(format!("creating directory {}", host.display()), e)
                    })?;
                    dir_modes.push((host, *mode));
                }
                Entry::File { mode, content } => {
                    create_parent(&host)?;
                    fs::write(&host, content)
                        .map_err(|e| StrataError::io(format!("writing {}", host.display()), e))?;
                    set_mode(&host, *mode)?;
                }
                Entry::Symlink { target } => {
                    create_parent(&host)?;
                    make_symlink(target, &host)?;
                }
                Entry::Whiteout => {}
            }
        }

        // Restrictive directory modes last, so children could still be written
        for (host, mode) in dir_modes.into_iter().rev() {
            set_mode(&host, mode)?;
        }

        debug!(
            "Materialized {} entries into {}",
            self.entries.len(),
            root.display()
        );
        Ok(())
    }

    fn remove_descendants(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        let doomed: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, _)| p.clone())
            .collect();
        for p in doomed {
            self.entries.remove(&p);
        }
    }

    /// Make every ancestor of `path` a directory, replacing files in the way
    fn ensure_parent_dirs(&mut self, path: &str) {
        let mut ancestor = paths::parent(path);
        let mut missing = Vec::new();
        while !ancestor.is_empty() {
            match self.entries.get(ancestor) {
                Some(Entry::Dir { .. }) => break,
                _ => missing.push(ancestor.to_string()),
            }
            ancestor = paths::parent(ancestor);
        }
        for dir in missing {
            self.entries.insert(
                dir,
                Entry::Dir {
                    mode: DEFAULT_DIR_MODE,
                },
            );
        }
    }
}

fn create_parent(host: &Path) -> StrataResult<()> {
    if let Some(parent) = host.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| StrataError::io(format!("creating directory {}", parent.display()), e))?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(host: &Path, mode: u32) -> StrataResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(host, fs::Permissions::from_mode(mode))
        .map_err(|e| StrataError::io(format!("setting permissions on {}", host.display()), e))
}

#[cfg(not(unix))]
fn set_mode(_host: &Path, _mode: u32) -> StrataResult<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &str, host: &Path) -> StrataResult<()> {
    std::os::unix::fs::symlink(target, host)
        .map_err(|e| StrataError::io(format!("creating symlink {}", host.display()), e))
}

#[cfg(not(unix))]
fn make_symlink(_target: &str, host: &Path) -> StrataResult<()> {
    Err(StrataError::PathInvalid {
        path: host.display().to_string(),
        reason: "symlinks are only supported on unix".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn delta(entries: &[(&str, Entry)]) -> LayerDelta {
        entries
            .iter()
            .map(|(p, e)| (p.to_string(), e.clone()))
            .collect()
    }

    #[test]
    fn later_layers_shadow_earlier() {
        let base = delta(&[("app/main.py", Entry::file(0o644, "v1"))]);
        let top = delta(&[("app/main.py", Entry::file(0o644, "v2"))]);
        let view = UnifiedView::from_deltas([&base, &top]);
        assert_eq!(view.get("app/main.py"), Some(&Entry::file(0o644, "v2")));
    }

    #[test]
    fn whiteout_removes_subtree() {
        let base = delta(&[
            ("cache", Entry::Dir { mode: 0o755 }),
            ("cache/blob", Entry::file(0o644, "x")),
            ("keep", Entry::file(0o644, "k")),
        ]);
        let top = delta(&[("cache", Entry::Whiteout)]);
        let view = UnifiedView::from_deltas([&base, &top]);
        assert!(view.get("cache").is_none());
        assert!(view.get("cache/blob").is_none());
        assert!(view.get("keep").is_some());
    }

    #[test]
    fn file_replacing_directory_drops_children() {
        let base = delta(&[("data/one", Entry::file(0o644, "1"))]);
        let top = delta(&[("data", Entry::file(0o644, "flat"))]);
        let view = UnifiedView::from_deltas([&base, &top]);
        assert!(view.get("data/one").is_none());
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn implicit_parents_are_directories() {
        let only = delta(&[("usr/local/bin/tool", Entry::file(0o755, "#!"))]);
        let view = UnifiedView::from_deltas([&only]);
        assert!(view.get("usr").unwrap().is_dir());
        assert!(view.get("usr/local/bin").unwrap().is_dir());
    }

    #[test]
    fn materialize_writes_files() {
        let only = delta(&[
            ("app/manifest", Entry::file(0o644, "deps")),
            ("app/run.sh", Entry::file(0o755, "#!/bin/sh\n")),
        ]);
        let view = UnifiedView::from_deltas([&only]);

        let dir = TempDir::new().unwrap();
        view.materialize(dir.path()).unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("app/manifest")).unwrap(),
            "deps"
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("app/run.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }
}
