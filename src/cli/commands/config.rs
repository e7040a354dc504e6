//! Config command - show or edit configuration

use crate::cache::CacheMode;
use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::cli::commands::current_dir;
use crate::config::{Config, ConfigManager, LOCAL_CONFIG_FILE};
use crate::error::{StrataError, StrataResult};
use crate::sandbox::Isolation;
use crate::ui::{self, UiContext};
use std::path::PathBuf;
use tokio::fs;

/// Keys accepted by `config set`; `build.env.<NAME>` and `launch.env.<NAME>` are also valid
const VALID_KEYS: &[&str] = &[
    "general.verbose",
    "general.log_format",
    "build.descriptor",
    "build.isolation",
    "build.base_dirs",
    "cache.enabled",
    "cache.mode",
    "cache.max_size_mb",
    "launch.isolation",
    "launch.keep_rootfs",
];

/// Execute the config command
pub async fn execute(
    args: ConfigArgs,
    config: &Config,
    manager: &ConfigManager,
) -> StrataResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value, local }) => {
            if local {
                set_local_value(&key, &value).await?
            } else {
                set_value(manager, config, &key, &value).await?
            }
        }
    }

    Ok(())
}

fn show_config(config: &Config) -> StrataResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> StrataResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(
        &ctx,
        "Configuration initialized",
        &path.display().to_string(),
    );
    Ok(())
}

async fn set_value(
    manager: &ConfigManager,
    config: &Config,
    key: &str,
    value: &str,
) -> StrataResult<()> {
    let ctx = UiContext::detect();
    if !is_known_key(key) {
        ui::step_error_detail(&ctx, "Unknown config key", key);
        ui::remark(&ctx, "Valid keys:");
        print_valid_keys();
        return Ok(());
    }

    let mut config = config.clone();
    apply(&mut config, key, value)?;
    manager.save(&config).await?;
    ui::step_ok(&ctx, &format!("Set {} = {}", key, value));
    Ok(())
}

fn is_known_key(key: &str) -> bool {
    let parts: Vec<&str> = key.split('.').collect();
    VALID_KEYS.contains(&key) || matches!(parts.as_slice(), ["build" | "launch", "env", _])
}

/// Apply one dot-separated key to a typed config
fn apply(config: &mut Config, key: &str, value: &str) -> StrataResult<()> {
    let parts: Vec<&str> = key.split('.').collect();
    match parts.as_slice() {
        ["general", "verbose"] => config.general.verbose = parse_bool(value)?,
        ["general", "log_format"] => config.general.log_format = parse_log_format(value)?,

        ["build", "descriptor"] => config.build.descriptor = value.to_string(),
        ["build", "isolation"] => config.build.isolation = parse_isolation(value)?,
        ["build", "base_dirs"] => {
            config.build.base_dirs = split_list(value).map(PathBuf::from).collect()
        }
        ["build", "env", name] => {
            config.build.env.insert((*name).to_string(), value.to_string());
        }

        ["cache", "enabled"] => config.cache.enabled = parse_bool(value)?,
        ["cache", "mode"] => config.cache.mode = parse_cache_mode(value)?,
        ["cache", "max_size_mb"] => config.cache.max_size_mb = parse_u64(value)?,

        ["launch", "isolation"] => config.launch.isolation = parse_isolation(value)?,
        ["launch", "keep_rootfs"] => config.launch.keep_rootfs = parse_bool(value)?,
        ["launch", "env", name] => {
            config.launch.env.insert((*name).to_string(), value.to_string());
        }

        _ => return Err(StrataError::User(format!("Unknown config key: {}", key))),
    }
    Ok(())
}

async fn set_local_value(key: &str, value: &str) -> StrataResult<()> {
    let ctx = UiContext::detect();
    let local_path = current_dir()?.join(LOCAL_CONFIG_FILE);

    // Reject unknown keys and bad values before touching the file
    apply(&mut Config::default(), key, value)?;

    let mut doc: toml::Value = if local_path.exists() {
        let content = fs::read_to_string(&local_path)
            .await
            .map_err(|e| StrataError::io(format!("reading {}", local_path.display()), e))?;
        content
            .parse()
            .map_err(|e: toml::de::Error| StrataError::ConfigInvalid {
                path: local_path.clone(),
                reason: e.to_string(),
            })?
    } else {
        toml::Value::Table(toml::map::Map::new())
    };

    set_toml_value(&mut doc, key, value)?;

    // Only the keys set explicitly end up in the local file
    let content = toml::to_string_pretty(&doc)?;
    fs::write(&local_path, content)
        .await
        .map_err(|e| StrataError::io(format!("writing {}", local_path.display()), e))?;

    ui::step_ok(
        &ctx,
        &format!("Set {} = {} in {}", key, value, local_path.display()),
    );
    Ok(())
}

/// Set a dot-separated key in a TOML value tree, creating intermediate tables as needed.
fn set_toml_value(doc: &mut toml::Value, key: &str, value: &str) -> StrataResult<()> {
    let parts: Vec<&str> = key.split('.').collect();
    let Some((leaf, tables)) = parts.split_last() else {
        return Err(StrataError::User("Empty config key".to_string()));
    };

    let mut current = doc;
    for &part in tables {
        current = current
            .as_table_mut()
            .ok_or_else(|| StrataError::User(format!("Expected table at key: {}", part)))?
            .entry(part)
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
    let table = current
        .as_table_mut()
        .ok_or_else(|| StrataError::User(format!("Expected table for key: {}", key)))?;

    let is_env = matches!(tables, ["build" | "launch", "env"]);
    let toml_value = if key == "build.base_dirs" {
        toml::Value::Array(split_list(value).map(toml::Value::from).collect())
    } else if is_env {
        toml::Value::String(value.to_string())
    } else if let Ok(flag) = parse_bool(value) {
        toml::Value::Boolean(flag)
    } else if let Ok(n) = value.parse::<i64>() {
        toml::Value::Integer(n)
    } else {
        toml::Value::String(value.to_string())
    };

    table.insert((*leaf).to_string(), toml_value);
    Ok(())
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_bool(value: &str) -> StrataResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" => Ok(true),
        "false" | "no" => Ok(false),
        _ => Err(StrataError::User(format!(
            "Invalid boolean value: {}. Use true/false",
            value
        ))),
    }
}

fn parse_u64(value: &str) -> StrataResult<u64> {
    value
        .parse()
        .map_err(|_| StrataError::User(format!("Invalid number: {}", value)))
}

fn parse_log_format(value: &str) -> StrataResult<String> {
    match value {
        "text" | "json" => Ok(value.to_string()),
        _ => Err(StrataError::User(format!(
            "Invalid log format: {}. Use text/json",
            value
        ))),
    }
}

fn parse_isolation(value: &str) -> StrataResult<Isolation> {
    toml::Value::String(value.to_string())
        .try_into::<Isolation>()
        .map_err(|_| StrataError::User(format!("Invalid isolation: {}. Use none/chroot", value)))
}

fn parse_cache_mode(value: &str) -> StrataResult<CacheMode> {
    toml::Value::String(value.to_string())
        .try_into::<CacheMode>()
        .map_err(|_| StrataError::User(format!("Invalid cache mode: {}. Use disk/memory", value)))
}

fn print_valid_keys() {
    for key in VALID_KEYS {
        eprintln!("  {}", key);
    }
    eprintln!("  build.env.<NAME>");
    eprintln!("  launch.env.<NAME>");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_typed_keys() {
        let mut config = Config::default();
        apply(&mut config, "cache.mode", "memory").unwrap();
        apply(&mut config, "cache.max_size_mb", "512").unwrap();
        apply(&mut config, "launch.isolation", "chroot").unwrap();
        apply(&mut config, "build.env.CC", "clang").unwrap();
        apply(&mut config, "build.base_dirs", "/opt/a, /opt/b").unwrap();

        assert_eq!(config.cache.mode, CacheMode::Memory);
        assert_eq!(config.cache.max_size_mb, 512);
        assert_eq!(config.launch.isolation, Isolation::Chroot);
        assert_eq!(config.build.env["CC"], "clang");
        assert_eq!(
            config.build.base_dirs,
            vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")]
        );
    }

    #[test]
    fn apply_rejects_bad_input() {
        let mut config = Config::default();
        assert!(apply(&mut config, "cache.mode", "tape").is_err());
        assert!(apply(&mut config, "cache.enabled", "maybe").is_err());
        assert!(apply(&mut config, "vm.name", "x").is_err());
        assert!(!is_known_key("cache"));
        assert!(is_known_key("launch.env.TERM"));
    }

    #[test]
    fn toml_value_types_follow_keys() {
        let mut doc = toml::Value::Table(toml::map::Map::new());
        set_toml_value(&mut doc, "cache.enabled", "false").unwrap();
        set_toml_value(&mut doc, "cache.max_size_mb", "64").unwrap();
        set_toml_value(&mut doc, "build.env.FLAG", "1").unwrap();
        set_toml_value(&mut doc, "build.base_dirs", "/a,/b").unwrap();

        let config = doc.try_into::<Config>().unwrap();
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.max_size_mb, 64);
        assert_eq!(config.build.env["FLAG"], "1");
        assert_eq!(config.build.base_dirs.len(), 2);
    }
}
