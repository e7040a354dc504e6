//! strata - layered image builds and launches
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use strata::cli::{commands, Cli, Commands};
use strata::config::{ConfigManager, DataDirs};
use strata::error::{StrataError, StrataResult};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(output) = e.captured_output() {
                eprintln!("{}", style("Command output:").dim());
                for line in output.lines() {
                    eprintln!("  {}", style(line).dim());
                }
            }
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> StrataResult<ExitCode> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    let local_config_path = if cli.no_local {
        None
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| StrataError::io("getting current directory", e))?;
        ConfigManager::find_local_config(&cwd)
    };

    let config = config_manager
        .load_merged(local_config_path.as_deref())
        .await?;

    // 0 = warn, 1 = info, 2+ = debug
    let verbosity = if config.general.verbose {
        cli.verbose.max(1)
    } else {
        cli.verbose
    };
    init_logging(verbosity, config.general.log_format == "json");
    strata::ui::init_theme();

    if cli.no_local {
        debug!("Local config discovery disabled (--no-local)");
    } else if let Some(ref path) = local_config_path {
        debug!("Loaded local config: {}", path.display());
    }

    if let Commands::Config(args) = cli.command {
        commands::config(args, &config, &config_manager).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let dirs = cli.data_dir.map(DataDirs::new).unwrap_or_default();
    debug!("Data directory: {}", dirs.root().display());
    dirs.ensure().await?;

    match cli.command {
        Commands::Build(args) => commands::build(args, &config, &dirs).await?,
        Commands::Run(args) => {
            let code = commands::run(args, &config, &dirs).await?;
            return Ok(u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from));
        }
        Commands::Images(args) => commands::images(args, &config, &dirs).await?,
        Commands::Inspect(args) => commands::inspect(args, &config, &dirs).await?,
        Commands::Rmi(args) => commands::rmi(args, &config, &dirs).await?,
        Commands::Tag(args) => commands::tag(args, &config, &dirs).await?,
        Commands::Cache(args) => commands::cache(args, &config, &dirs).await?,
        Commands::Config(_) => unreachable!("config handled above"),
    }

    Ok(ExitCode::SUCCESS)
}

fn init_logging(verbosity: u8, json: bool) {
    let filter = match verbosity {
        0 => EnvFilter::new("strata=warn"),
        1 => EnvFilter::new("strata=info"),
        _ => EnvFilter::new("strata=debug"),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        subscriber.json().init();
    } else {
        subscriber.without_time().init();
    }
}
