//! Image path handling
//!
//! Inside an image, working directories are absolute (`/app`). Layer deltas
//! key their entries by the same path without the leading slash (`app/main.py`)
//! so they can be joined onto any host directory.

use crate::error::{StrataError, StrataResult};
use std::path::{Path, PathBuf};

/// Resolve `path` against `base`, both image paths. The result is absolute and
/// normalized; `..` never climbs above `/`.
pub fn resolve(base: &str, path: &str) -> StrataResult<String> {
    if path.is_empty() {
        return Err(StrataError::PathInvalid {
            path: path.to_string(),
            reason: "empty path".to_string(),
        });
    }
    if path.contains('\0') {
        return Err(StrataError::PathInvalid {
            path: path.escape_default().to_string(),
            reason: "contains NUL byte".to_string(),
        });
    }

    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", base, path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    Ok(format!("/{}", parts.join("/")))
}

/// Strip the leading slash of an absolute image path
pub fn relative(abs: &str) -> &str {
    abs.trim_start_matches('/')
}

/// Join a relative entry path onto a relative directory
pub fn join(dir: &str, name: &str) -> String {
    match (dir.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => dir.to_string(),
        _ => format!("{}/{}", dir, name),
    }
}

/// Host location of an image path below a materialized root
pub fn host_path(root: &Path, image_path: &str) -> PathBuf {
    let rel = relative(image_path);
    if rel.is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    }
}

/// Whether relative entry `path` lies strictly below `ancestor`
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor.is_empty() {
        return !path.is_empty();
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Parent of a relative entry path (`""` for top-level entries)
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[..pos],
        None => "",
    }
}

/// Validate a context-relative path specification entry
pub fn validate_context_path(path: &str) -> StrataResult<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(StrataError::context_read(path, "empty path"));
    }
    if trimmed.starts_with('/') {
        return Err(StrataError::context_read(
            path,
            "absolute paths are not allowed in the build context",
        ));
    }

    let mut parts = Vec::new();
    for part in trimmed.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(StrataError::context_read(
                    path,
                    "path escapes the build context",
                ))
            }
            other => parts.push(other),
        }
    }

    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_relative_and_absolute() {
        assert_eq!(resolve("/", "app").unwrap(), "/app");
        assert_eq!(resolve("/app", "src").unwrap(), "/app/src");
        assert_eq!(resolve("/app", "/usr/src/app").unwrap(), "/usr/src/app");
        assert_eq!(resolve("/app", ".").unwrap(), "/app");
    }

    #[test]
    fn resolve_clamps_at_root() {
        assert_eq!(resolve("/app", "../../..").unwrap(), "/");
        assert_eq!(resolve("/a/b", "../c").unwrap(), "/a/c");
    }

    #[test]
    fn resolve_rejects_empty() {
        assert!(resolve("/", "").is_err());
    }

    #[test]
    fn descendant_checks_component_boundary() {
        assert!(is_descendant("app/main.py", "app"));
        assert!(!is_descendant("application", "app"));
        assert!(!is_descendant("app", "app"));
        assert!(is_descendant("anything", ""));
    }

    #[test]
    fn parent_of_entries() {
        assert_eq!(parent("a/b/c"), "a/b");
        assert_eq!(parent("a"), "");
    }

    #[test]
    fn context_path_validation() {
        assert_eq!(validate_context_path("./src/main.rs").unwrap(), "src/main.rs");
        assert_eq!(validate_context_path(".").unwrap(), "");
        assert!(validate_context_path("/etc/passwd").is_err());
        assert!(validate_context_path("../secret").is_err());
    }

    #[test]
    fn host_path_of_root() {
        let root = Path::new("/tmp/rootfs");
        assert_eq!(host_path(root, "/"), PathBuf::from("/tmp/rootfs"));
        assert_eq!(host_path(root, "/app"), PathBuf::from("/tmp/rootfs/app"));
    }
}
