//! RunCommand execution
//!
//! The parent chain is materialized into a scratch root, the command runs
//! inside it and the filesystem difference becomes the new layer's delta.

use crate::error::{StrataError, StrataResult};
use crate::layer::{LayerChain, LayerDelta, Snapshot};
use crate::launcher::ExitOutcome;
use crate::sandbox::{remove_tree, Isolation, ProcessSpec, Sandbox, StdioMode};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tracing::debug;
use uuid::Uuid;

/// Exit code reported when `argv[0]` cannot be found
pub const COMMAND_NOT_FOUND: i32 = 127;

/// Everything a RUN step needs besides the parent chain
pub(crate) struct RunRequest<'a> {
    pub argv: &'a [String],
    pub working_dir: &'a str,
    pub env: &'a BTreeMap<String, String>,
    pub isolation: Isolation,
    /// Parent directory for the scratch root
    pub work_dir: &'a Path,
}

/// Scratch root removed on drop, whatever the step outcome
struct ScratchRoot(PathBuf);

impl Drop for ScratchRoot {
    fn drop(&mut self) {
        remove_tree(&self.0);
    }
}

/// Run `request.argv` on top of `chain` and return the filesystem delta.
///
/// A non-zero exit is a `CommandExecution` error carrying the tail of the
/// combined output; nothing is returned for the partial filesystem.
pub(crate) async fn run(
    chain: &LayerChain,
    request: RunRequest<'_>,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> StrataResult<LayerDelta> {
    let scratch = ScratchRoot(
        request
            .work_dir
            .join(format!("build-{}", Uuid::new_v4().simple())),
    );
    let root = scratch.0.join("rootfs");

    let view = chain.view();
    let target = root.clone();
    let before = tokio::task::spawn_blocking(move || {
        view.materialize(&target)?;
        Snapshot::capture(&target)
    })
    .await
    .map_err(|e| StrataError::Internal(format!("materialize task failed: {}", e)))??;

    let command_line = request.argv.join(" ");
    let sandbox = Sandbox::new(&root, request.isolation);
    let Some(program) =
        sandbox.resolve_executable(&request.argv[0], request.working_dir, request.env)
    else {
        let line = format!("{}: command not found", request.argv[0]);
        on_output(line.clone());
        return Err(StrataError::command_exec(command_line, COMMAND_NOT_FOUND, &[line]));
    };

    let spec = ProcessSpec {
        argv: request.argv.to_vec(),
        working_dir: request.working_dir.to_string(),
        env: request.env.clone(),
        stdio: StdioMode::Piped,
    };
    debug!("Running {} in {}", command_line, root.display());
    let mut child = sandbox
        .command(&program, &spec)?
        .spawn()
        .map_err(|e| StrataError::command_failed(&command_line, e))?;

    let output = stream_child_output(&mut child, on_output).await;
    let status = child
        .wait()
        .await
        .map_err(|e| StrataError::command_failed(&command_line, e))?;
    let outcome = ExitOutcome::from_status(status);
    if !outcome.success() {
        debug!("{} {}", command_line, outcome);
        return Err(StrataError::command_exec(command_line, outcome.code(), &output));
    }

    let diff_root = root.clone();
    let delta = tokio::task::spawn_blocking(move || {
        let after = Snapshot::capture(&diff_root)?;
        before.diff(&after, &diff_root)
    })
    .await
    .map_err(|e| StrataError::Internal(format!("snapshot task failed: {}", e)))??;

    drop(scratch);
    Ok(delta)
}

/// Stream stdout and stderr line by line, returning all lines in arrival order.
///
/// Lines are read as raw bytes and decoded lossily; both pipes are drained
/// until EOF or a read error so the child never blocks on a full pipe.
async fn stream_child_output(
    child: &mut Child,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> Vec<String> {
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Vec::new();
    };

    let mut stderr_reader = BufReader::new(stderr);
    let mut stdout_reader = BufReader::new(stdout);
    let mut stderr_buf = Vec::new();
    let mut stdout_buf = Vec::new();

    let mut all_output = Vec::new();
    let mut stderr_done = false;
    let mut stdout_done = false;

    while !stderr_done || !stdout_done {
        tokio::select! {
            read = stderr_reader.read_until(b'\n', &mut stderr_buf), if !stderr_done => {
                match read {
                    Ok(0) | Err(_) => {
                        if !stderr_buf.is_empty() {
                            emit_line(&mut stderr_buf, on_output, &mut all_output);
                        }
                        stderr_done = true;
                    }
                    Ok(_) => emit_line(&mut stderr_buf, on_output, &mut all_output),
                }
            }
            read = stdout_reader.read_until(b'\n', &mut stdout_buf), if !stdout_done => {
                match read {
                    Ok(0) | Err(_) => {
                        if !stdout_buf.is_empty() {
                            emit_line(&mut stdout_buf, on_output, &mut all_output);
                        }
                        stdout_done = true;
                    }
                    Ok(_) => emit_line(&mut stdout_buf, on_output, &mut all_output),
                }
            }
        }
    }

    all_output
}

fn emit_line(
    buf: &mut Vec<u8>,
    on_output: &(dyn Fn(String) + Send + Sync),
    all_output: &mut Vec<String>,
) {
    let mut bytes = &buf[..];
    if let Some(rest) = bytes.strip_suffix(b"\n") {
        bytes = rest.strip_suffix(b"\r").unwrap_or(rest);
    }
    let line = String::from_utf8_lossy(bytes).into_owned();
    buf.clear();
    on_output(line.clone());
    all_output.push(line);
}
