//! Container launcher
//!
//! Launching materializes the image's unified view into a fresh container
//! directory, resolves the command inside it and starts exactly one process
//! with the image's working directory.

mod container;

pub use container::{Container, ContainerOutput, ExitOutcome};

use crate::error::{StrataError, StrataResult};
use crate::image::Image;
use crate::sandbox::{remove_tree, Isolation, ProcessSpec, Sandbox, StdioMode};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Per-launch settings
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Replaces the image's default command entirely
    pub command: Option<Vec<String>>,
    /// Set on top of the inherited environment
    pub env: BTreeMap<String, String>,
    pub stdio: StdioMode,
    /// Keep the container directory after the handle is dropped
    pub keep_rootfs: bool,
}

/// Starts containers below a containers directory
#[derive(Debug, Clone)]
pub struct Launcher {
    containers_dir: PathBuf,
    isolation: Isolation,
}

impl Launcher {
    pub fn new(containers_dir: impl Into<PathBuf>, isolation: Isolation) -> Self {
        Self {
            containers_dir: containers_dir.into(),
            isolation,
        }
    }

    pub fn containers_dir(&self) -> &Path {
        &self.containers_dir
    }

    /// Start one process from `image`
    pub async fn launch(&self, image: &Image, options: LaunchOptions) -> StrataResult<Container> {
        let image_name = image.id.short().to_string();
        let argv = match options
            .command
            .clone()
            .or_else(|| image.config.default_command.clone())
        {
            Some(argv) if !argv.is_empty() => argv,
            Some(_) => return Err(StrataError::launch(&image_name, "command is empty")),
            None => {
                return Err(StrataError::launch(
                    &image_name,
                    "image has no default command and no command was given",
                ))
            }
        };

        let id = Uuid::new_v4().simple().to_string();
        let dir = self.containers_dir.join(&id);
        let rootfs = dir.join("rootfs");
        fs::create_dir_all(&rootfs)
            .map_err(|e| StrataError::io(format!("creating {}", rootfs.display()), e))?;

        match self.start(image, &argv, &options, &rootfs).await {
            Ok(child) => {
                info!(
                    "Started container {} from {} (pid {:?})",
                    id,
                    image_name,
                    child.id()
                );
                Ok(Container::new(
                    id,
                    image.id.clone(),
                    argv,
                    dir,
                    options.keep_rootfs,
                    child,
                ))
            }
            Err(e) => {
                if !options.keep_rootfs {
                    remove_tree(&dir);
                }
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        image: &Image,
        argv: &[String],
        options: &LaunchOptions,
        rootfs: &Path,
    ) -> StrataResult<tokio::process::Child> {
        let image_name = image.id.short().to_string();

        let view = image.view();
        let target = rootfs.to_path_buf();
        tokio::task::spawn_blocking(move || view.materialize(&target))
            .await
            .map_err(|e| StrataError::Internal(format!("materialize task failed: {}", e)))?
            .map_err(|e| StrataError::launch(&image_name, format!("cannot build filesystem view: {}", e)))?;

        let sandbox = Sandbox::new(rootfs, self.isolation);
        let working_dir = image.working_dir().to_string();
        let program = sandbox
            .resolve_executable(&argv[0], &working_dir, &options.env)
            .ok_or_else(|| {
                StrataError::launch(
                    &image_name,
                    format!("executable '{}' not found", argv[0]),
                )
            })?;

        debug!("Launching {} as {:?}", program.display(), argv);
        let spec = ProcessSpec {
            argv: argv.to_vec(),
            working_dir,
            env: options.env.clone(),
            stdio: options.stdio,
        };
        sandbox
            .command(&program, &spec)?
            .spawn()
            .map_err(|e| StrataError::launch(&image_name, format!("cannot start process: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{assemble, ImageConfig};
    use crate::layer::{Entry, Layer, LayerChain, LayerDelta};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn image(working_dir: &str, cmd: Option<Vec<String>>) -> Image {
        let mut delta = LayerDelta::new();
        delta.insert("app/data.txt", Entry::file(0o644, "payload"));
        let base = Layer::new(None, "FROM scratch:latest".into(), delta.digest(), delta);
        let mut chain = LayerChain::new();
        chain.push(Arc::new(base)).unwrap();
        assemble(
            chain,
            ImageConfig {
                working_dir: working_dir.into(),
                default_command: cmd,
            },
        )
        .unwrap()
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn missing_command_is_launch_error() {
        let dir = TempDir::new().unwrap();
        let launcher = Launcher::new(dir.path(), Isolation::None);
        let err = launcher
            .launch(&image("/", None), LaunchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Launch { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_executable_is_launch_error() {
        let dir = TempDir::new().unwrap();
        let launcher = Launcher::new(dir.path(), Isolation::None);
        let img = image("/", Some(vec!["no-such-binary-anywhere".into()]));
        let err = launcher.launch(&img, LaunchOptions::default()).await.unwrap_err();
        assert!(matches!(err, StrataError::Launch { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_default_command_in_working_dir() {
        let dir = TempDir::new().unwrap();
        let launcher = Launcher::new(dir.path(), Isolation::None);
        let img = image("/app", Some(sh("cat data.txt")));

        let container = launcher
            .launch(
                &img,
                LaunchOptions {
                    stdio: StdioMode::Piped,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let output = container.wait_with_output().await.unwrap();
        assert!(output.outcome.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "payload");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let launcher = Launcher::new(dir.path(), Isolation::None);
        let img = image("/", Some(sh("exit 7")));

        let mut container = launcher
            .launch(
                &img,
                LaunchOptions {
                    stdio: StdioMode::Null,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let rootfs = container.rootfs();
        assert!(rootfs.exists());
        assert_eq!(container.wait().await.unwrap(), ExitOutcome::Exited(7));
        drop(container);
        assert!(!rootfs.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_reports_signal() {
        let dir = TempDir::new().unwrap();
        let launcher = Launcher::new(dir.path(), Isolation::None);
        let img = image("/", Some(sh("sleep 30")));

        let mut container = launcher
            .launch(
                &img,
                LaunchOptions {
                    stdio: StdioMode::Null,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(container.try_wait().unwrap().is_none());
        let outcome = container.kill().await.unwrap();
        assert_eq!(outcome, ExitOutcome::Signaled(libc::SIGKILL));
        assert_eq!(outcome.code(), 137);
    }
}
