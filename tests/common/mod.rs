//! Shared test utilities

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use plexus_gateway::plugins::{
    BackgroundService, ChannelPlugin, PluginApi, PluginFactory, PluginImporter, PluginManifest,
};
use plexus_gateway::{Config, Error, Result};

/// Write `<root>/<dir_name>/plugin.json` and an empty entry file
pub fn write_plugin(root: &Path, dir_name: &str, id: &str, main: &str) -> PathBuf {
    let dir = root.join(dir_name);
    std::fs::create_dir_all(&dir).expect("create plugin dir");
    let manifest = serde_json::json!({ "id": id, "name": id, "main": main });
    std::fs::write(dir.join("plugin.json"), manifest.to_string()).expect("write manifest");
    std::fs::write(dir.join(main), "").expect("write entry");
    dir
}

/// Config scanning `dirs` first and `global` as the global plugin dir
pub fn test_config(dirs: &[&Path], global: &Path) -> Config {
    let mut config = Config::default();
    config.plugins.dirs = dirs.iter().map(|d| d.to_path_buf()).collect();
    config.plugins.global_dir = global.to_path_buf();
    config
}

type Register = Arc<dyn Fn(PluginApi, u64) -> anyhow::Result<()> + Send + Sync>;

/// Importer that builds plugins from in-test closures keyed by plugin id
///
/// Each closure receives the api and the import generation.
#[derive(Default)]
pub struct ScriptedImporter {
    plugins: HashMap<String, Register>,
    imports: Mutex<Vec<(String, u64, PathBuf)>>,
}

impl ScriptedImporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plugin<F>(mut self, id: &str, register: F) -> Self
    where
        F: Fn(PluginApi, u64) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.plugins.insert(id.to_string(), Arc::new(register));
        self
    }

    /// `(plugin id, generation, plugin dir)` for every import so far
    pub fn imports(&self) -> Vec<(String, u64, PathBuf)> {
        self.imports.lock().unwrap().clone()
    }
}

#[async_trait]
impl PluginImporter for ScriptedImporter {
    async fn import(
        &self,
        manifest: &PluginManifest,
        dir: &Path,
        _entry: &Path,
        generation: u64,
    ) -> Result<PluginFactory> {
        let register = self
            .plugins
            .get(&manifest.id)
            .cloned()
            .ok_or_else(|| Error::Process(format!("no script for {}", manifest.id)))?;
        self.imports
            .lock()
            .unwrap()
            .push((manifest.id.clone(), generation, dir.to_path_buf()));

        Ok(PluginFactory::function(move |api: PluginApi| {
            let register = Arc::clone(&register);
            async move { register(api, generation) }
        }))
    }
}

/// Channel that counts lifecycle calls and records sent messages
#[derive(Default)]
pub struct CountingChannel {
    pub id: String,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl CountingChannel {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            ..Self::default()
        })
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelPlugin for CountingChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_text(&self, target: &str, text: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((target.to_string(), text.to_string()));
        Ok(())
    }
}

/// Background service that counts lifecycle calls
#[derive(Default)]
pub struct CountingService {
    pub name: String,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl CountingService {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ..Self::default()
        })
    }
}

#[async_trait]
impl BackgroundService for CountingService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
