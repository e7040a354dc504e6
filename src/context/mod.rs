//! Build context reader
//!
//! The build context is captured into memory when a build starts, so every
//! instruction of one build sees the same files no matter what happens on
//! disk meanwhile. Copy instructions select subsets of it by path or glob and
//! get back the selected entries plus a digest that only depends on what was
//! selected.

use crate::digest::{Digest, DigestBuilder};
use crate::error::{StrataError, StrataResult};
use crate::layer::delta::walk_tree;
use crate::layer::{Entry, LayerDelta};
use crate::paths;
use glob::{MatchOptions, Pattern};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the ignore file at the context root
pub const IGNORE_FILE: &str = ".strataignore";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// In-memory snapshot of a build context directory
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
    files: BTreeMap<String, Entry>,
}

/// Files chosen by a path specification
#[derive(Debug, Clone)]
pub struct Selection {
    pub entries: BTreeMap<String, Entry>,
    pub digest: Digest,
}

impl Selection {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Selected entries as a delta rooted at the context
    pub fn to_delta(&self) -> LayerDelta {
        self.entries
            .iter()
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect()
    }
}

impl BuildContext {
    /// Read every file and symlink below `root`, minus ignored paths
    pub fn capture(root: &Path) -> StrataResult<Self> {
        let meta = fs::metadata(root)
            .map_err(|e| StrataError::context_read(root.display().to_string(), e.to_string()))?;
        if !meta.is_dir() {
            return Err(StrataError::context_read(
                root.display().to_string(),
                "not a directory",
            ));
        }

        let ignore = load_ignore_patterns(root)?;
        let mut files = BTreeMap::new();

        walk_tree(root, &mut |rel, host, meta| {
            if meta.is_dir() || (rel != IGNORE_FILE && is_ignored(&ignore, rel)) {
                return Ok(());
            }
            let entry = Entry::read(host, meta)
                .map_err(|e| StrataError::context_read(rel, e.to_string()))?;
            files.insert(rel.to_string(), entry);
            Ok(())
        })?;

        debug!(
            "Captured build context {} ({} files, {} ignore patterns)",
            root.display(),
            files.len(),
            ignore.len()
        );

        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    /// Context built from in-memory entries
    pub fn from_entries(root: impl Into<PathBuf>, files: BTreeMap<String, Entry>) -> Self {
        Self {
            root: root.into(),
            files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.files.iter()
    }

    /// Select the files named by `spec`.
    ///
    /// Each entry is a context-relative path or glob; `.` and `**` select
    /// everything and a directory selects its subtree. Every entry must
    /// match at least one file.
    pub fn select(&self, spec: &[String]) -> StrataResult<Selection> {
        if spec.is_empty() {
            return Err(StrataError::context_read("", "empty path specification"));
        }

        let mut entries = BTreeMap::new();
        for raw in spec {
            let matched = self.select_one(raw)?;
            if matched.is_empty() {
                return Err(StrataError::context_read(
                    raw.as_str(),
                    "no such file or directory in build context",
                ));
            }
            for path in matched {
                if let Some(entry) = self.files.get(path) {
                    entries.insert(path.clone(), entry.clone());
                }
            }
        }

        let digest = digest_entries(&entries);
        Ok(Selection { entries, digest })
    }

    fn select_one(&self, raw: &str) -> StrataResult<Vec<&String>> {
        let path = paths::validate_context_path(raw)?;

        if path.is_empty() || path == "**" {
            return Ok(self.files.keys().collect());
        }

        let literal: Vec<&String> = self
            .files
            .keys()
            .filter(|p| **p == path || paths::is_descendant(p, &path))
            .collect();
        if !literal.is_empty() || !has_glob_meta(&path) {
            return Ok(literal);
        }

        let pattern = Pattern::new(&path)
            .map_err(|e| StrataError::context_read(raw, format!("invalid pattern: {}", e)))?;
        Ok(self
            .files
            .keys()
            .filter(|p| matches_self_or_ancestor(&pattern, p))
            .collect())
    }
}

/// Digest over sorted (path, kind, mode, length, bytes) records
pub fn digest_entries(entries: &BTreeMap<String, Entry>) -> Digest {
    let mut hasher = DigestBuilder::new();
    for (path, entry) in entries {
        entry.hash_into(path, &mut hasher);
    }
    hasher.finish()
}

fn has_glob_meta(path: &str) -> bool {
    path.contains(['*', '?', '['])
}

/// Whether `path` or one of its parent directories matches
fn matches_self_or_ancestor(pattern: &Pattern, path: &str) -> bool {
    let mut candidate = path;
    loop {
        if pattern.matches_with(candidate, MATCH_OPTIONS) {
            return true;
        }
        candidate = paths::parent(candidate);
        if candidate.is_empty() {
            return false;
        }
    }
}

fn is_ignored(patterns: &[Pattern], rel: &str) -> bool {
    patterns.iter().any(|p| matches_self_or_ancestor(p, rel))
}

fn load_ignore_patterns(root: &Path) -> StrataResult<Vec<Pattern>> {
    let path = root.join(IGNORE_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StrataError::context_read(IGNORE_FILE, e.to_string())),
    };

    let mut patterns = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.trim_start_matches("./").trim_end_matches('/');
        let pattern = Pattern::new(line).map_err(|e| {
            StrataError::context_read(IGNORE_FILE, format!("line {}: {}", idx + 1, e))
        })?;
        patterns.push(pattern);
    }
    Ok(patterns)
}
