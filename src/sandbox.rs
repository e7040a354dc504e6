//! Process preparation inside a materialized root filesystem
//!
//! Shared by RUN steps and container launch: resolves `argv[0]`, picks the
//! working directory and applies the isolation mode.

use crate::error::{StrataError, StrataResult};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Directories searched for bare command names inside the root filesystem
const ROOTFS_PATH: &[&str] = &[
    "/usr/local/sbin",
    "/usr/local/bin",
    "/usr/sbin",
    "/usr/bin",
    "/sbin",
    "/bin",
];

/// How processes are confined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Host process whose working directory lies inside the root filesystem
    #[default]
    None,
    /// `chroot(2)` into the root filesystem (needs privileges)
    Chroot,
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Chroot => write!(f, "chroot"),
        }
    }
}

impl std::str::FromStr for Isolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "chroot" => Ok(Self::Chroot),
            other => Err(format!("unknown isolation '{}' (none, chroot)", other)),
        }
    }
}

/// Output handling of a spawned process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// Share the caller's terminal
    #[default]
    Inherit,
    /// Capture stdout and stderr
    Piped,
    /// Discard everything
    Null,
}

impl StdioMode {
    fn stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Piped => Stdio::piped(),
            Self::Null => Stdio::null(),
        }
    }
}

/// Everything needed to start one process
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    /// Absolute image path
    pub working_dir: String,
    /// Variables set on top of the inherited environment
    pub env: BTreeMap<String, String>,
    pub stdio: StdioMode,
}

/// A root filesystem processes can run in
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    isolation: Isolation,
}

impl Sandbox {
    pub fn new(root: impl Into<PathBuf>, isolation: Isolation) -> Self {
        Self {
            root: root.into(),
            isolation,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Host directory of an image working directory, created if missing
    pub fn prepare_working_dir(&self, working_dir: &str) -> StrataResult<PathBuf> {
        let host = paths::host_path(&self.root, working_dir);
        fs::create_dir_all(&host)
            .map_err(|e| StrataError::io(format!("creating working directory {}", host.display()), e))?;
        Ok(host)
    }

    /// Program to execute for `argv0`, or `None` if it cannot be found.
    ///
    /// Under `chroot` the result is an image path, otherwise a host path.
    pub fn resolve_executable(
        &self,
        argv0: &str,
        working_dir: &str,
        env: &BTreeMap<String, String>,
    ) -> Option<PathBuf> {
        if argv0.is_empty() {
            return None;
        }

        if argv0.contains('/') {
            let image_path = paths::resolve(working_dir, argv0).ok()?;
            if let Some(found) = self.in_rootfs(&image_path) {
                return Some(found);
            }
            if self.isolation == Isolation::None && argv0.starts_with('/') {
                let host = PathBuf::from(argv0);
                return is_executable(&host).then_some(host);
            }
            return None;
        }

        for dir in ROOTFS_PATH {
            if let Some(found) = self.in_rootfs(&format!("{}/{}", dir, argv0)) {
                return Some(found);
            }
        }

        if self.isolation == Isolation::None {
            let path_var = env
                .get("PATH")
                .map(OsString::from)
                .or_else(|| std::env::var_os("PATH"))?;
            return std::env::split_paths(&path_var)
                .map(|dir| dir.join(argv0))
                .find(|candidate| is_executable(candidate));
        }

        None
    }

    fn in_rootfs(&self, image_path: &str) -> Option<PathBuf> {
        let host = paths::host_path(&self.root, image_path);
        if !is_executable(&host) {
            return None;
        }
        Some(match self.isolation {
            Isolation::None => host,
            Isolation::Chroot => PathBuf::from(image_path),
        })
    }

    /// Build the command for `spec`. The caller has already resolved `program`.
    pub fn command(&self, program: &Path, spec: &ProcessSpec) -> StrataResult<Command> {
        let mut cmd = Command::new(program);
        if let Some(argv0) = spec.argv.first() {
            #[cfg(unix)]
            cmd.arg0(argv0);
            #[cfg(not(unix))]
            let _ = argv0;
        }
        cmd.args(spec.argv.iter().skip(1))
            .envs(&spec.env)
            .stdin(match spec.stdio {
                StdioMode::Inherit => Stdio::inherit(),
                _ => Stdio::null(),
            })
            .stdout(spec.stdio.stdio())
            .stderr(spec.stdio.stdio())
            .kill_on_drop(true);

        let host_dir = self.prepare_working_dir(&spec.working_dir)?;
        match self.isolation {
            Isolation::None => {
                cmd.current_dir(&host_dir);
            }
            Isolation::Chroot => self.apply_chroot(&mut cmd, &spec.working_dir)?,
        }

        debug!(
            "Prepared {:?} in {} (isolation {})",
            spec.argv,
            spec.working_dir,
            self.isolation
        );
        Ok(cmd)
    }

    #[cfg(unix)]
    fn apply_chroot(&self, cmd: &mut Command, working_dir: &str) -> StrataResult<()> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let root = CString::new(self.root.as_os_str().as_bytes()).map_err(|_| {
            StrataError::PathInvalid {
                path: self.root.display().to_string(),
                reason: "contains NUL byte".to_string(),
            }
        })?;
        let dir = CString::new(working_dir).map_err(|_| StrataError::PathInvalid {
            path: working_dir.to_string(),
            reason: "contains NUL byte".to_string(),
        })?;

        // SAFETY: the closure only calls async-signal-safe functions on
        // buffers allocated before fork.
        unsafe {
            cmd.pre_exec(move || {
                if libc::chroot(root.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::chdir(dir.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn apply_chroot(&self, _cmd: &mut Command, _working_dir: &str) -> StrataResult<()> {
        Err(StrataError::User(
            "chroot isolation is only available on unix".to_string(),
        ))
    }
}

/// Remove a materialized tree, restoring write permission where needed
pub(crate) fn remove_tree(dir: &Path) {
    if !dir.exists() {
        return;
    }
    make_writable(dir);
    if let Err(e) = fs::remove_dir_all(dir) {
        warn!("Failed to remove {}: {}", dir.display(), e);
    }
}

#[cfg(unix)]
fn make_writable(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let Ok(meta) = fs::symlink_metadata(dir) else {
        return;
    };
    if !meta.is_dir() {
        return;
    }
    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        let _ = fs::set_permissions(dir, fs::Permissions::from_mode(mode | 0o700));
    }
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            make_writable(&entry.path());
        }
    }
}

#[cfg(not(unix))]
fn make_writable(_dir: &Path) {}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
