//! Plugin loader and lifecycle manager
//!
//! Loads discovered plugins in precedence order (configured dirs, then the
//! global dir) and builtins strictly after, keeping a record of what was
//! loaded from where so plugins can later be torn down and reloaded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use serde::Serialize;

use super::api::{DetachedContext, GatewayContext, PluginApi};
use super::discovery::{PluginSource, discover, plugin_roots};
use super::factory::{BuiltinPlugin, Plugin, invoke_register};
use super::manifest::PluginManifest;
use super::process::{PluginImporter, ProcessImporter};
use super::registry::PluginRegistry;
use crate::config::Config;
use crate::{Error, Result};

/// A currently loaded plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedPluginInfo {
    pub manifest: PluginManifest,
    pub source: PluginSource,
    /// Plugin directory, external plugins only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl LoadedPluginInfo {
    /// Absolute entry point, external plugins only
    #[must_use]
    pub fn entry_path(&self) -> Option<PathBuf> {
        self.path.as_ref().map(|dir| dir.join(&self.manifest.main))
    }
}

/// A plugin that failed to load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadFailure {
    pub id: String,
    pub error: String,
}

/// Outcome of a load pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Ids loaded by this pass, in load order
    pub loaded: Vec<String>,
    pub errors: Vec<LoadFailure>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Loads plugins into a [`PluginRegistry`] and tracks them for reload
pub struct PluginLoader {
    config: Arc<Config>,
    registry: PluginRegistry,
    ctx: Arc<dyn GatewayContext>,
    importer: Arc<dyn PluginImporter>,
    builtins: Vec<BuiltinPlugin>,
    loaded: Mutex<IndexMap<String, LoadedPluginInfo>>,
    instances: Mutex<HashMap<String, Arc<dyn Plugin>>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("loaded", &lock(&self.loaded).keys().collect::<Vec<_>>())
            .field("builtins", &self.builtins.len())
            .finish_non_exhaustive()
    }
}

impl PluginLoader {
    /// Loader with the subprocess importer, no builtins and no gateway context
    #[must_use]
    pub fn new(config: Arc<Config>, registry: PluginRegistry) -> Self {
        Self {
            config,
            registry,
            ctx: Arc::new(DetachedContext),
            importer: Arc::new(ProcessImporter),
            builtins: Vec::new(),
            loaded: Mutex::new(IndexMap::new()),
            instances: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_context(mut self, ctx: Arc<dyn GatewayContext>) -> Self {
        self.ctx = ctx;
        self
    }

    #[must_use]
    pub fn with_importer(mut self, importer: Arc<dyn PluginImporter>) -> Self {
        self.importer = importer;
        self
    }

    #[must_use]
    pub fn with_builtins(mut self, builtins: Vec<BuiltinPlugin>) -> Self {
        self.builtins = builtins;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Discover and load every external plugin
    ///
    /// Failures are logged and reported; they never stop the remaining
    /// candidates from loading.
    pub async fn load_all(&self) -> LoadReport {
        let candidates = discover(&plugin_roots(&self.config));
        tracing::info!(count = candidates.len(), "discovered plugin candidates");

        let mut report = LoadReport::default();

        for candidate in candidates {
            let id = candidate.manifest.id.clone();

            if self.config.plugins.is_disabled(&id) {
                tracing::debug!(plugin_id = %id, "skipping disabled plugin");
                continue;
            }

            if let Some(existing) = self.plugin_info(&id) {
                tracing::debug!(
                    plugin_id = %id,
                    loaded_from = %existing.source,
                    "plugin already loaded, skipping"
                );
                continue;
            }

            match self
                .load_external(candidate.manifest, &candidate.dir, candidate.source)
                .await
            {
                Ok(()) => report.loaded.push(id),
                Err(e) => {
                    tracing::error!(plugin_id = %id, error = %e, "failed to load plugin");
                    report.errors.push(LoadFailure {
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }

    /// Load the compiled-in plugins
    ///
    /// Must run after [`load_all`](Self::load_all) so external plugins take
    /// precedence over builtins.
    pub async fn load_builtins(&self) -> LoadReport {
        let mut report = LoadReport::default();

        for builtin in &self.builtins {
            let id = builtin.manifest.id.clone();

            if self.config.plugins.is_disabled(&id) {
                tracing::debug!(plugin_id = %id, "skipping disabled builtin");
                continue;
            }
            if self.plugin_info(&id).is_some() {
                tracing::debug!(plugin_id = %id, "builtin shadowed by loaded plugin, skipping");
                continue;
            }

            let plugin = builtin.factory.clone().resolve();
            let api = self.api_for(&builtin.manifest, PluginSource::Builtin);

            match invoke_register(&plugin, api).await {
                Ok(()) => {
                    self.record(
                        LoadedPluginInfo {
                            manifest: builtin.manifest.clone(),
                            source: PluginSource::Builtin,
                            path: None,
                        },
                        plugin,
                    );
                    tracing::info!(plugin_id = %id, "loaded builtin plugin");
                    report.loaded.push(id);
                }
                Err(e) => {
                    tracing::error!(plugin_id = %id, error = %e, "failed to load builtin plugin");
                    plugin.unload().await;
                    report.errors.push(LoadFailure {
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }

    /// Import, register and record one external plugin
    ///
    /// # Errors
    ///
    /// Returns error if the entry point is missing, the import fails or the
    /// plugin's registration fails
    pub(crate) async fn load_external(
        &self,
        manifest: PluginManifest,
        dir: &Path,
        source: PluginSource,
    ) -> Result<()> {
        let entry = dir.join(&manifest.main);
        if !entry.is_file() {
            return Err(Error::EntryNotFound(entry));
        }

        let generation = self.next_generation();
        let factory = self
            .importer
            .import(&manifest, dir, &entry, generation)
            .await?;
        let plugin = factory.resolve();

        let api = self.api_for(&manifest, source);
        if let Err(e) = invoke_register(&plugin, api).await {
            plugin.unload().await;
            return Err(Error::Plugin {
                id: manifest.id,
                reason: e.to_string(),
            });
        }

        tracing::info!(
            plugin_id = %manifest.id,
            source = %source,
            path = %dir.display(),
            generation,
            "loaded plugin"
        );

        self.record(
            LoadedPluginInfo {
                manifest,
                source,
                path: Some(dir.to_path_buf()),
            },
            plugin,
        );
        Ok(())
    }

    pub(crate) fn api_for(&self, manifest: &PluginManifest, source: PluginSource) -> PluginApi {
        PluginApi::new(
            manifest.clone(),
            source,
            Arc::clone(&self.config),
            self.registry.clone(),
            Arc::clone(&self.ctx),
        )
    }

    /// Store (or replace) the record and instance for a plugin
    pub(crate) fn record(&self, info: LoadedPluginInfo, plugin: Arc<dyn Plugin>) {
        let id = info.manifest.id.clone();
        lock(&self.instances).insert(id.clone(), plugin);
        lock(&self.loaded).insert(id, info);
    }

    #[must_use]
    pub fn plugin_info(&self, id: &str) -> Option<LoadedPluginInfo> {
        lock(&self.loaded).get(id).cloned()
    }

    /// Loaded plugins in load order
    #[must_use]
    pub fn loaded_plugins(&self) -> Vec<LoadedPluginInfo> {
        lock(&self.loaded).values().cloned().collect()
    }

    /// Remove every registration made by `id` and release its instance
    ///
    /// Registry removal completes synchronously before anything is awaited.
    /// When the gateway is running, the removed services and channels are
    /// then stopped (failures are logged) and the plugin instance is
    /// unloaded. The loaded-plugin record is kept so the plugin can be
    /// reloaded. Calling this for a plugin with nothing registered is a
    /// no-op.
    pub async fn teardown_plugin(&self, id: &str) {
        let removed = self.registry.teardown(id);

        if self.registry.is_running() {
            for service in &removed.services {
                if let Err(e) = service.stop().await {
                    tracing::warn!(plugin_id = %id, service = %service.name(), error = %e, "failed to stop service");
                }
            }
            for channel in &removed.channels {
                if let Err(e) = channel.stop().await {
                    tracing::warn!(plugin_id = %id, channel = %channel.id(), error = %e, "failed to stop channel");
                }
            }
        }

        let instance = lock(&self.instances).remove(id);
        if let Some(plugin) = instance {
            plugin.unload().await;
        }

        tracing::debug!(plugin_id = %id, "plugin torn down");
    }

    /// Tear down every plugin in reverse load order and forget it
    ///
    /// Leaves nothing registered on behalf of a loaded plugin, so a later
    /// load pass starts from scratch.
    pub async fn unload_all(&self) {
        let ids: Vec<String> = lock(&self.loaded).keys().rev().cloned().collect();
        for id in &ids {
            self.teardown_plugin(id).await;
        }
        lock(&self.loaded).clear();
    }

    /// Next import generation
    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn importer(&self) -> Arc<dyn PluginImporter> {
        Arc::clone(&self.importer)
    }
}
