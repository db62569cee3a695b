//! Plugin manifest format (`plugin.json`)

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// File name every plugin directory must contain
pub const MANIFEST_FILE: &str = "plugin.json";

/// Plugin manifest describing a plugin's identity and entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier, stable across reloads
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Entry point, relative to the plugin directory
    pub main: String,
    /// Semver version string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Short description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PluginManifest {
    /// Manifest for a plugin compiled into the gateway
    #[must_use]
    pub fn builtin(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            main: format!("builtin:{id}"),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            description: None,
        }
    }

    /// Read and validate the manifest at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, is not valid JSON, or is
    /// missing `id` or `main`
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|reason| Error::Manifest {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn parse(content: &str) -> std::result::Result<Self, String> {
        let manifest: Self = serde_json::from_str(content).map_err(|e| e.to_string())?;
        if manifest.id.trim().is_empty() {
            return Err("missing plugin id".to_string());
        }
        if manifest.main.trim().is_empty() {
            return Err("missing entry point (main)".to_string());
        }
        Ok(manifest)
    }
}
