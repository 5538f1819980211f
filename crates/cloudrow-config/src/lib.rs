pub mod error;
pub mod settings;

pub use error::*;
pub use settings::{
    EngineSettings, LeaseSettings, MAX_RUN_TIMEOUT_SECS, RetrySettings, ScopeSettings, Settings,
    WaitSettings,
};

use std::path::PathBuf;

/// Environment variable naming a settings file directly
pub const CONFIG_PATH_ENV: &str = "CLOUDROW_CONFIG_PATH";

const CANDIDATES: [&str; 4] = [
    "cloudrow.local.yaml",
    ".cloudrow.local.yaml",
    "cloudrow.yaml",
    ".cloudrow.yaml",
];

/// cloudrow's directory under the user config dir, created on first use
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("cloudrow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Locate the settings file.
///
/// Search order:
/// 1. `CLOUDROW_CONFIG_PATH`
/// 2. the current directory: cloudrow.local.yaml, .cloudrow.local.yaml, cloudrow.yaml, .cloudrow.yaml
/// 3. `./.cloudrow/`, same order
/// 4. `~/.config/cloudrow/cloudrow.yaml`
pub fn find_settings_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let project_dir = current_dir.join(".cloudrow");
    if project_dir.is_dir() {
        for filename in &CANDIDATES {
            let path = project_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join("cloudrow").join("cloudrow.yaml");
        if global.exists() {
            return Ok(global);
        }
    }

    Err(ConfigError::SettingsFileNotFound)
}

/// Load the discovered settings file, falling back to defaults when there is none.
pub fn load_settings() -> Result<(Settings, Option<PathBuf>)> {
    match find_settings_file() {
        Ok(path) => Ok((Settings::load(&path)?, Some(path))),
        Err(ConfigError::SettingsFileNotFound) => Ok((Settings::default(), None)),
        Err(e) => Err(e),
    }
}
