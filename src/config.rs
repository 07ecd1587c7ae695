//! Configuration loading and persistence.
//!
//! The config file lists the ports `command-port serve` opens at startup:
//!
//! ```json
//! { "ports": [ { "name": ":7001", "lang": "shell", "echo_output": true } ] }
//! ```
//!
//! Every [`PortOptions`] field may appear next to `name` and `lang`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::constants::CONFIG_PATH_ENV;
use crate::options::PortOptions;
use crate::registry::SHELL_LANGUAGE;

/// One port to open at startup.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PortEntry {
    /// Port name (`host:port`, `:port`, or a socket path/name).
    pub name: String,
    /// Language key of the evaluator.
    #[serde(default = "default_lang")]
    pub lang: String,
    /// Remaining per-port options.
    #[serde(flatten)]
    pub options: PortOptions,
}

fn default_lang() -> String {
    SHELL_LANGUAGE.to_string()
}

/// Configuration for the command-port binary.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Ports opened by `serve`.
    #[serde(default)]
    pub ports: Vec<PortEntry>,
}

impl Config {
    /// Returns the platform configuration directory for command-port.
    pub fn config_dir() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("command-port"))
    }

    /// Picks the config file path.
    ///
    /// Priority: explicit path, then `COMMAND_PORT_CONFIG`, then
    /// `<config dir>/command-port/config.json`.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        let from_env = std::env::var(CONFIG_PATH_ENV).ok().filter(|v| !v.is_empty());
        match (explicit, from_env) {
            (Some(path), _) => Ok(path.to_path_buf()),
            (None, Some(path)) => Ok(PathBuf::from(path)),
            (None, None) => Ok(Self::config_dir()?.join("config.json")),
        }
    }

    /// Loads the configuration; a missing file yields the default.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit)?;
        Self::load_from(&path)
    }

    /// Loads from a specific file; a missing file yields the default.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("[Config] {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))?;
        log::info!("[Config] Loaded {} port(s) from {}", config.ports.len(), path.display());
        Ok(config)
    }

    /// Persists the configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_no_ports() {
        assert!(Config::default().ports.is_empty());
    }

    #[test]
    fn test_missing_file_is_default() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::load_from(&tmp.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_port_entry_flattens_options() {
        let json = r#"{ "ports": [
            { "name": ":7001", "echo_output": true, "buffer_size": 8 },
            { "name": "/tmp/cmd", "lang": "mel", "prefix": "print" }
        ] }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.ports[0].lang, SHELL_LANGUAGE);
        assert!(config.ports[0].options.echo_output);
        assert!(config.ports[0].options.send_results);
        assert_eq!(config.ports[0].options.buffer_size, 8);
        assert_eq!(config.ports[1].lang, "mel");
        assert_eq!(config.ports[1].options.prefix, "print");
    }

    #[test]
    fn test_save_then_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.json");
        let config = Config {
            ports: vec![PortEntry {
                name: ":7002".to_string(),
                lang: "shell".to_string(),
                options: PortOptions {
                    return_command_count: true,
                    ..PortOptions::default()
                },
            }],
        };
        config.save(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_json_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid config"));
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = Path::new("/etc/command-port.json");
        assert_eq!(Config::resolve_path(Some(path)).unwrap(), path);
    }
}
