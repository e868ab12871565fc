//! Settings file handling.

use anyhow::Result;
use hullsync_server::ServerSettings;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "config/server.toml";

/// Load settings, falling back to defaults when the file is missing,
/// unreadable or invalid.
pub fn load_settings(path: &Path) -> ServerSettings {
    match fs::read_to_string(path) {
        Ok(contents) => match ServerSettings::from_toml(&contents) {
            Ok(settings) => settings,
            Err(err) => {
                warn!("Invalid settings in {}: {err:#}. Using defaults", path.display());
                ServerSettings::default()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("No settings file at {}. Using defaults", path.display());
            ServerSettings::default()
        }
        Err(err) => {
            warn!("Failed to read {}: {err}. Using defaults", path.display());
            ServerSettings::default()
        }
    }
}

/// Load settings, returning every problem to the caller.
pub fn load_settings_strict(path: &Path) -> Result<ServerSettings> {
    ServerSettings::load_file(path)
}

/// Write settings as TOML, creating parent directories.
pub fn save_settings(settings: &ServerSettings, path: &Path) -> Result<()> {
    settings.save_file(path)
}
