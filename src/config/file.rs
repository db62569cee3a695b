//! TOML configuration file loading
//!
//! Supports `~/.config/plexus/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct PlexusConfigFile {
    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Plugin runtime configuration
    #[serde(default)]
    pub plugins: PluginsFileConfig,
}

/// Server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// HTTP API port
    pub port: Option<u16>,

    /// Bearer token for the HTTP API
    pub api_key: Option<String>,
}

/// Plugin discovery and hot-reload configuration
#[derive(Debug, Default, Deserialize)]
pub struct PluginsFileConfig {
    /// Extra plugin roots, scanned before the global directory
    #[serde(default)]
    pub dirs: Vec<String>,

    /// Override for the global plugin directory
    pub global_dir: Option<String>,

    /// Plugin ids that are never loaded
    #[serde(default)]
    pub disabled: Vec<String>,

    /// Per-plugin configuration blobs keyed by plugin id
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,

    /// File watcher settings
    #[serde(default)]
    pub watch: WatchFileConfig,
}

/// Watcher settings
#[derive(Debug, Default, Deserialize)]
pub struct WatchFileConfig {
    pub enabled: Option<bool>,
    pub debounce_ms: Option<u64>,
    pub extensions: Option<Vec<String>>,
    pub ignore: Option<Vec<String>>,
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the content is not valid TOML for this schema
pub fn parse_config_file(content: &str) -> crate::Result<PlexusConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file from the standard path
///
/// Returns `PlexusConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> PlexusConfigFile {
    let Some(path) = config_file_path() else {
        return PlexusConfigFile::default();
    };

    if !path.exists() {
        return PlexusConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                PlexusConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            PlexusConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/plexus/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("plexus").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_file() {
        let fc = parse_config_file("").unwrap();
        assert!(fc.server.port.is_none());
        assert!(fc.plugins.dirs.is_empty());
    }

    #[test]
    fn parse_plugins_section() {
        let fc = parse_config_file(
            r#"
            [server]
            port = 9000

            [plugins]
            dirs = ["~/dev/plugins", "/opt/plexus/plugins"]
            disabled = ["noisy"]

            [plugins.config.weather]
            units = "metric"

            [plugins.watch]
            enabled = true
            debounce_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(fc.server.port, Some(9000));
        assert_eq!(fc.plugins.dirs.len(), 2);
        assert_eq!(fc.plugins.disabled, vec!["noisy"]);
        assert_eq!(fc.plugins.config["weather"]["units"], "metric");
        assert_eq!(fc.plugins.watch.enabled, Some(true));
        assert_eq!(fc.plugins.watch.debounce_ms, Some(250));
    }

    #[test]
    fn reject_malformed_file() {
        let err = parse_config_file("[plugins\ndirs = 3").unwrap_err();
        assert!(matches!(err, crate::Error::Toml(_)));
    }
}
