//! Load the `[env]` table from `$XDG_CONFIG_HOME/<app>/config.toml`.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::LoadError;

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    env: HashMap<String, toml::Value>,
}

/// `$XDG_CONFIG_HOME/<app>/config.toml`, falling back to `~/.config/<app>/config.toml`.
fn config_path(app_name: &str) -> Result<PathBuf, LoadError> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.trim().is_empty() {
            return Ok(PathBuf::from(xdg).join(app_name).join("config.toml"));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| LoadError::XdgPath("no home directory".into()))?;
    Ok(home.join(".config").join(app_name).join("config.toml"))
}

/// Stringifies a TOML value the way env vars expect: bare strings unquoted,
/// everything else via its TOML display form.
fn value_to_string(v: &toml::Value) -> String {
    match v {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Loads the `[env]` table into a map. Missing file returns an empty map.
pub fn load_env_map(app_name: &str) -> Result<HashMap<String, String>, LoadError> {
    let path = config_path(app_name)?;
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
    let parsed: ConfigFile = toml::from_str(&content)?;
    Ok(parsed
        .env
        .iter()
        .map(|(k, v)| (k.clone(), value_to_string(v)))
        .collect())
}
