use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use bat_types::config::BatConfig;

/// Overrides the state directory (tests, multiple gateways on one host).
pub const HOME_ENV: &str = "BATCHISMO_HOME";

/// Returns the Batchismo home directory (`$BATCHISMO_HOME` or ~/.batchismo/)
pub fn bat_home() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".batchismo"))
}

/// Returns the path to the config file (<home>/config.toml)
pub fn config_path() -> Result<PathBuf> {
    Ok(bat_home()?.join("config.toml"))
}

/// Returns the trace database path (<home>/trace.db)
pub fn db_path() -> Result<PathBuf> {
    Ok(bat_home()?.join("trace.db"))
}

/// Load config from the default location, creating it if it doesn't exist.
pub fn load_config() -> Result<BatConfig> {
    load_config_from(&config_path()?)
}

/// Load config from `path`, writing the default config there on first run.
pub fn load_config_from(path: &Path) -> Result<BatConfig> {
    if !path.exists() {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let default = BatConfig::default();
        save_config_to(&default, path)?;
        return Ok(default);
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: BatConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;
    Ok(config)
}

pub fn save_config_to(config: &BatConfig, path: &Path) -> Result<()> {
    let toml_str = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, toml_str)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}
