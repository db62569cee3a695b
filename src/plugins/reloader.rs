//! Plugin hot reload
//!
//! A reload tears down everything the plugin registered, imports a fresh
//! instance (a new process for external plugins) and runs its registration
//! again. Builtins cannot be reloaded.
//!
//! If the reimport or the registration fails, the plugin stays torn down.
//! The previous instance is already gone at that point and is not restored;
//! the failure is reported and a later reload can bring the plugin back.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::discovery::PluginSource;
use super::factory::invoke_register;
use super::loader::{LoadedPluginInfo, PluginLoader};
use super::manifest::{MANIFEST_FILE, PluginManifest};

/// Reasons a reload can fail
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReloadError {
    #[error("plugin {0} is not loaded")]
    NotLoaded(String),

    #[error("cannot reload builtin plugin {0} (requires gateway restart)")]
    Builtin(String),

    #[error("entry point not found: {}", .0.display())]
    EntryMissing(PathBuf),

    #[error("reload already in progress for plugin {0}")]
    InProgress(String),

    #[error("failed to reimport plugin {id}: {reason}")]
    Import { id: String, reason: String },

    #[error("failed to register plugin {id}: {reason}")]
    Registration { id: String, reason: String },
}

/// Outcome of a reload, returned to every trigger (HTTP, RPC, command, watcher)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadResult {
    pub success: bool,
    pub plugin_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ReloadResult {
    fn new(plugin_id: &str, started: Instant, outcome: Result<(), ReloadError>) -> Self {
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Self {
            success: outcome.is_ok(),
            plugin_id: plugin_id.to_string(),
            error: outcome.err().map(|e| e.to_string()),
            timestamp: Utc::now(),
            duration_ms,
        }
    }

    /// Human-readable summary
    #[must_use]
    pub fn message(&self) -> String {
        match &self.error {
            None => format!("Plugin {} reloaded in {}ms", self.plugin_id, self.duration_ms),
            Some(error) => format!("Reload failed: {error}"),
        }
    }
}

/// Anything that can reload a plugin by id
#[async_trait]
pub trait Reload: Send + Sync {
    async fn reload(&self, plugin_id: &str) -> ReloadResult;
}

/// Removes the id from the in-flight set when dropped
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Reloads external plugins in place
#[derive(Debug)]
pub struct PluginReloader {
    loader: Arc<PluginLoader>,
    in_flight: Mutex<HashSet<String>>,
}

impl PluginReloader {
    #[must_use]
    pub fn new(loader: Arc<PluginLoader>) -> Self {
        Self {
            loader,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Ids of loaded plugins that can be reloaded (everything but builtins)
    #[must_use]
    pub fn list_reloadable(&self) -> Vec<String> {
        self.loader
            .loaded_plugins()
            .into_iter()
            .filter(|info| info.source.is_external())
            .map(|info| info.manifest.id)
            .collect()
    }

    /// Directory of a loaded external plugin
    #[must_use]
    pub fn plugin_dir(&self, plugin_id: &str) -> Option<PathBuf> {
        self.loader.plugin_info(plugin_id).and_then(|info| info.path)
    }

    fn begin(&self, plugin_id: &str) -> Option<InFlight<'_>> {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !set.insert(plugin_id.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            id: plugin_id.to_string(),
        })
    }

    async fn try_reload(&self, plugin_id: &str) -> Result<(), ReloadError> {
        let info = self
            .loader
            .plugin_info(plugin_id)
            .ok_or_else(|| ReloadError::NotLoaded(plugin_id.to_string()))?;

        if info.source == PluginSource::Builtin {
            return Err(ReloadError::Builtin(plugin_id.to_string()));
        }
        let dir = info
            .path
            .clone()
            .ok_or_else(|| ReloadError::Builtin(plugin_id.to_string()))?;

        let _guard = self
            .begin(plugin_id)
            .ok_or_else(|| ReloadError::InProgress(plugin_id.to_string()))?;

        // The manifest is re-read so renamed entry points are picked up
        let manifest = PluginManifest::load(&dir.join(MANIFEST_FILE)).map_err(|e| {
            ReloadError::Import {
                id: plugin_id.to_string(),
                reason: e.to_string(),
            }
        })?;
        if manifest.id != plugin_id {
            return Err(ReloadError::Import {
                id: plugin_id.to_string(),
                reason: format!("manifest id changed to {}", manifest.id),
            });
        }

        let entry = dir.join(&manifest.main);
        if !entry.is_file() {
            return Err(ReloadError::EntryMissing(entry));
        }

        self.loader.teardown_plugin(plugin_id).await;

        let generation = self.loader.next_generation();
        tracing::debug!(plugin_id = %plugin_id, generation, "reimporting plugin");

        let factory = self
            .loader
            .importer()
            .import(&manifest, &dir, &entry, generation)
            .await
            .map_err(|e| ReloadError::Import {
                id: plugin_id.to_string(),
                reason: e.to_string(),
            })?;
        let plugin = factory.resolve();

        let api = self.loader.api_for(&manifest, info.source);
        if let Err(e) = invoke_register(&plugin, api).await {
            plugin.unload().await;
            return Err(ReloadError::Registration {
                id: plugin_id.to_string(),
                reason: e.to_string(),
            });
        }

        self.loader.record(
            LoadedPluginInfo {
                manifest,
                source: info.source,
                path: Some(dir),
            },
            plugin,
        );

        let registry = self.loader.registry();
        if registry.is_running() {
            for channel in registry.channels_of(plugin_id) {
                if let Err(e) = channel.start().await {
                    tracing::warn!(plugin_id = %plugin_id, channel = %channel.id(), error = %e, "failed to start reloaded channel");
                }
            }
            for service in registry.services_of(plugin_id) {
                if let Err(e) = service.start().await {
                    tracing::warn!(plugin_id = %plugin_id, service = %service.name(), error = %e, "failed to start reloaded service");
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Reload for PluginReloader {
    /// Reload a plugin by id
    ///
    /// Never fails outright: every outcome, including "not loaded" and
    /// "builtin", is reported through the returned [`ReloadResult`].
    async fn reload(&self, plugin_id: &str) -> ReloadResult {
        let started = Instant::now();
        tracing::info!(plugin_id = %plugin_id, "reloading plugin");

        let outcome = self.try_reload(plugin_id).await;
        let result = ReloadResult::new(plugin_id, started, outcome);

        match &result.error {
            None => {
                tracing::info!(plugin_id = %plugin_id, duration_ms = result.duration_ms, "plugin reloaded");
            }
            Some(error) => {
                tracing::warn!(plugin_id = %plugin_id, error = %error, "plugin reload failed");
            }
        }

        result
    }
}
