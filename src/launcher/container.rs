//! Running container handle

use crate::error::{StrataError, StrataResult};
use crate::image::ImageId;
use crate::sandbox::remove_tree;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use tokio::process::Child;
use tracing::debug;

/// How a container's root process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited with a status code
    Exited(i32),
    /// Terminated by a signal
    Signaled(i32),
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }
        Self::Exited(status.code().unwrap_or(1))
    }

    /// Exit code to report; signals map to `128 + signal`
    pub fn code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(signal) => 128 + signal,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            Self::Signaled(signal) => Some(*signal),
            Self::Exited(_) => None,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(signal) => write!(f, "terminated by signal {}", signal),
        }
    }
}

/// Captured result of a container run
#[derive(Debug, Clone)]
pub struct ContainerOutput {
    pub outcome: ExitOutcome,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// One running process instantiated from an image.
///
/// The container directory is removed when the handle is dropped, unless
/// the container was launched with `keep_rootfs`.
#[derive(Debug)]
pub struct Container {
    id: String,
    image: ImageId,
    argv: Vec<String>,
    dir: PathBuf,
    keep: bool,
    pid: Option<u32>,
    child: Option<Child>,
    outcome: Option<ExitOutcome>,
}

impl Container {
    pub(crate) fn new(
        id: String,
        image: ImageId,
        argv: Vec<String>,
        dir: PathBuf,
        keep: bool,
        child: Child,
    ) -> Self {
        Self {
            pid: child.id(),
            id,
            image,
            argv,
            dir,
            keep,
            child: Some(child),
            outcome: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &ImageId {
        &self.image
    }

    /// Argv the root process was started with
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// OS process id of the root process
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Host directory of the container's root filesystem
    pub fn rootfs(&self) -> PathBuf {
        self.dir.join("rootfs")
    }

    fn child_mut(&mut self) -> StrataResult<&mut Child> {
        self.child
            .as_mut()
            .ok_or_else(|| StrataError::Internal(format!("container {} already consumed", self.id)))
    }

    /// Wait for the root process to end
    pub async fn wait(&mut self) -> StrataResult<ExitOutcome> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        let id = self.id.clone();
        let status = self
            .child_mut()?
            .wait()
            .await
            .map_err(|e| StrataError::io(format!("waiting for container {}", id), e))?;
        let outcome = ExitOutcome::from_status(status);
        debug!("Container {} {}", self.id, outcome);
        self.outcome = Some(outcome);
        Ok(outcome)
    }

    /// Exit outcome if the root process has already ended
    pub fn try_wait(&mut self) -> StrataResult<Option<ExitOutcome>> {
        if let Some(outcome) = self.outcome {
            return Ok(Some(outcome));
        }
        let id = self.id.clone();
        let status = self
            .child_mut()?
            .try_wait()
            .map_err(|e| StrataError::io(format!("polling container {}", id), e))?;
        let outcome = status.map(ExitOutcome::from_status);
        self.outcome = outcome;
        Ok(outcome)
    }

    /// Send `signal` to the root process
    #[cfg(unix)]
    pub fn signal(&self, signal: i32) -> StrataResult<()> {
        let pid = match (self.outcome, self.pid) {
            (None, Some(pid)) => pid,
            _ => {
                return Err(StrataError::User(format!(
                    "container {} is not running",
                    self.id
                )))
            }
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| StrataError::Internal(format!("pid {} out of range", pid)))?;
        // SAFETY: kill(2) has no memory safety requirements
        let result = unsafe { libc::kill(pid, signal) };
        if result != 0 {
            return Err(StrataError::io(
                format!("signalling container {}", self.id),
                std::io::Error::last_os_error(),
            ));
        }
        debug!("Sent signal {} to container {}", signal, self.id);
        Ok(())
    }

    /// Forcefully terminate the root process and wait for it
    pub async fn kill(&mut self) -> StrataResult<ExitOutcome> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        let id = self.id.clone();
        self.child_mut()?
            .start_kill()
            .map_err(|e| StrataError::io(format!("killing container {}", id), e))?;
        self.wait().await
    }

    /// Wait for exit and collect piped output
    pub async fn wait_with_output(mut self) -> StrataResult<ContainerOutput> {
        let child = self
            .child
            .take()
            .ok_or_else(|| StrataError::Internal(format!("container {} already consumed", self.id)))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StrataError::io(format!("waiting for container {}", self.id), e))?;
        let outcome = ExitOutcome::from_status(output.status);
        self.outcome = Some(outcome);
        Ok(ContainerOutput {
            outcome,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        remove_tree(&self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_maps_to_shell_code() {
        assert_eq!(ExitOutcome::Exited(3).code(), 3);
        assert_eq!(ExitOutcome::Signaled(9).code(), 137);
        assert!(ExitOutcome::Exited(0).success());
        assert!(!ExitOutcome::Signaled(15).success());
        assert_eq!(ExitOutcome::Signaled(15).signal(), Some(15));
    }

    #[test]
    fn outcome_display() {
        assert_eq!(ExitOutcome::Exited(2).to_string(), "exited with code 2");
        assert_eq!(
            ExitOutcome::Signaled(9).to_string(),
            "terminated by signal 9"
        );
    }
}
