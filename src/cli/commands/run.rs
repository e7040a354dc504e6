//! Run command - start a container from an image

use crate::cli::args::RunArgs;
use crate::cli::commands::open_images;
use crate::config::{Config, DataDirs};
use crate::error::StrataResult;
use crate::launcher::{LaunchOptions, Launcher};
use crate::sandbox::StdioMode;
use crate::ui::{self, UiContext};
use tracing::{debug, info};

/// Execute the run command, returning the container's exit code
pub async fn execute(args: RunArgs, config: &Config, dirs: &DataDirs) -> StrataResult<i32> {
    let images = open_images(dirs)?;
    let image = images.get(&args.image)?;

    let mut env = config.launch.env.clone();
    env.extend(args.env);

    let keep_rootfs = args.keep || config.launch.keep_rootfs;
    let options = LaunchOptions {
        command: (!args.command.is_empty()).then_some(args.command),
        env,
        stdio: StdioMode::Inherit,
        keep_rootfs,
    };

    let launcher = Launcher::new(dirs.containers(), config.launch.isolation);
    let mut container = launcher.launch(&image, options).await?;
    debug!("Container {} runs {:?}", container.id(), container.argv());

    // Ctrl-C also reaches the child; stop it if it lingers
    let finished = tokio::select! {
        outcome = container.wait() => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    let outcome = match finished {
        Some(outcome) => outcome?,
        None => {
            info!("Interrupted, stopping container {}", container.id());
            container.kill().await?
        }
    };

    if keep_rootfs {
        let ctx = UiContext::detect();
        ui::remark(
            &ctx,
            &format!("Root filesystem kept at {}", container.rootfs().display()),
        );
    }

    Ok(outcome.code())
}
