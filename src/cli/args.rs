//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// strata - layered image builds and launches
///
/// Builds reproducible layered filesystem images from a Stratafile, caching
/// every step, and runs them as isolated processes.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Skip local .strata.toml discovery
    #[arg(long, global = true)]
    pub no_local: bool,

    /// State directory for cache, images and containers
    #[arg(long, global = true, env = "STRATA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an image from a build context
    Build(BuildArgs),

    /// Run a container from an image
    Run(RunArgs),

    /// List images
    Images(ImagesArgs),

    /// Show image details
    Inspect(InspectArgs),

    /// Remove an image
    Rmi(RmiArgs),

    /// Tag an image
    Tag(TagArgs),

    /// Manage the layer cache
    Cache(CacheArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Build context directory (defaults to current directory)
    pub context: Option<PathBuf>,

    /// Descriptor file (defaults to CONTEXT/Stratafile)
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Tag for the built image (name[:tag])
    #[arg(short, long)]
    pub tag: Vec<String>,

    /// Neither consult nor populate the layer cache
    #[arg(long)]
    pub no_cache: bool,

    /// Print only the image id
    #[arg(short, long)]
    pub quiet: bool,

    /// Environment for RUN steps (KEY=VALUE)
    #[arg(long = "build-env", value_parser = parse_env_var)]
    pub build_env: Vec<(String, String)>,
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Image tag or id
    pub image: String,

    /// Additional environment variables (KEY=VALUE)
    #[arg(short, long, value_parser = parse_env_var)]
    pub env: Vec<(String, String)>,

    /// Keep the container root filesystem after exit
    #[arg(long)]
    pub keep: bool,

    /// Command and arguments to run instead of the image's default command
    #[arg(last = true)]
    pub command: Vec<String>,
}

/// Arguments for the images command
#[derive(Parser, Debug)]
pub struct ImagesArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the inspect command
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Image tag or id
    pub image: String,
}

/// Arguments for the rmi command
#[derive(Parser, Debug)]
pub struct RmiArgs {
    /// Image tag or id
    pub image: String,
}

/// Arguments for the tag command
#[derive(Parser, Debug)]
pub struct TagArgs {
    /// Image tag or id
    pub image: String,

    /// New tag (name[:tag])
    pub tag: String,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., cache.mode)
        key: String,
        /// Value to set
        value: String,
        /// Write to project-local .strata.toml instead of global config
        #[arg(long)]
        local: bool,
    },
}

/// Output format for listings
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cache entries, least recently used first
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Evict least recently used entries until the cache fits
    Prune {
        /// Size bound in MB (default: from config)
        #[arg(long)]
        max_size_mb: Option<u64>,
    },

    /// Remove every cache entry
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Parse environment variable in KEY=VALUE format
fn parse_env_var(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE format: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_var_valid() {
        let (k, v) = parse_env_var("FOO=bar").unwrap();
        assert_eq!(k, "FOO");
        assert_eq!(v, "bar");
    }

    #[test]
    fn parse_env_var_with_equals() {
        let (k, v) = parse_env_var("FOO=bar=baz").unwrap();
        assert_eq!(k, "FOO");
        assert_eq!(v, "bar=baz");
    }

    #[test]
    fn parse_env_var_invalid() {
        assert!(parse_env_var("FOO").is_err());
    }

    #[test]
    fn cli_parses_build() {
        let cli = Cli::parse_from(["strata", "build", "app", "-t", "app:v1", "--no-cache"]);
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.context, Some(PathBuf::from("app")));
                assert_eq!(args.tag, vec!["app:v1"]);
                assert!(args.no_cache);
                assert!(!args.quiet);
            }
            _ => panic!("expected Build command"),
        }
    }

    #[test]
    fn cli_parses_run_override() {
        let cli = Cli::parse_from(["strata", "run", "app", "-e", "A=1", "--", "ls", "-la"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.image, "app");
                assert_eq!(args.env, vec![("A".to_string(), "1".to_string())]);
                assert_eq!(args.command, vec!["ls", "-la"]);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_cache_prune() {
        let cli = Cli::parse_from(["strata", "cache", "prune", "--max-size-mb", "5"]);
        match cli.command {
            Commands::Cache(CacheArgs {
                action: CacheAction::Prune { max_size_mb },
            }) => assert_eq!(max_size_mb, Some(5)),
            _ => panic!("expected cache prune"),
        }
    }

    #[test]
    fn cli_no_local_flag() {
        let cli = Cli::parse_from(["strata", "--no-local", "images"]);
        assert!(cli.no_local);
    }

    #[test]
    fn cli_verbose_levels() {
        let cli = Cli::parse_from(["strata", "images"]);
        assert_eq!(cli.verbose, 0);

        let cli = Cli::parse_from(["strata", "-v", "images"]);
        assert_eq!(cli.verbose, 1);

        let cli = Cli::parse_from(["strata", "-vv", "images"]);
        assert_eq!(cli.verbose, 2);
    }
}
