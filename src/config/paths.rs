//! Where the agent keeps its files.
//!
//! One data directory holds the config file, the logs and the skills. It is
//! `$BARBARIC_DATA_DIR` when set, otherwise `barbaric/data` under the
//! platform config directory (`%APPDATA%`, `~/Library/Application Support`,
//! `$XDG_CONFIG_HOME` or `~/.config`).

use std::ffi::OsString;
use std::path::PathBuf;

/// Overrides the data directory, e.g. for a portable install.
pub const DATA_DIR_ENV: &str = "BARBARIC_DATA_DIR";

const APP_DIR: &str = "barbaric";
const CONFIG_FILE: &str = "agent_config.json";

fn resolve_data_dir(override_dir: Option<OsString>, config_dir: Option<PathBuf>) -> PathBuf {
    match override_dir.filter(|dir| !dir.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => config_dir
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("data"),
    }
}

pub fn get_data_dir() -> PathBuf {
    resolve_data_dir(std::env::var_os(DATA_DIR_ENV), dirs::config_dir())
}

/// Rolling log files.
pub fn get_log_dir() -> PathBuf {
    get_data_dir().join("logs")
}

/// Scanned for skill scripts unless the config names another directory.
pub fn get_skills_dir() -> PathBuf {
    get_data_dir().join("skills")
}

pub fn get_config_path() -> PathBuf {
    get_data_dir().join(CONFIG_FILE)
}
