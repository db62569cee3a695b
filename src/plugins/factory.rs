//! Plugin factories and the canonical [`Plugin`] trait
//!
//! A plugin is either a bare registration function or an object with a
//! `register` method. Both shapes are resolved once, at load time, into an
//! `Arc<dyn Plugin>` so callers never branch on the shape again.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use super::api::PluginApi;
use super::manifest::PluginManifest;

/// A loaded plugin instance
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Register contributions through `api`
    async fn register(&self, api: PluginApi) -> anyhow::Result<()>;

    /// Release resources held outside the registry (processes, sockets)
    async fn unload(&self) {}
}

/// Bare registration function
pub type RegisterFn = Arc<dyn Fn(PluginApi) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// The two accepted plugin shapes
#[derive(Clone)]
pub enum PluginFactory {
    Function(RegisterFn),
    Object(Arc<dyn Plugin>),
}

impl std::fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function(_) => f.write_str("PluginFactory::Function"),
            Self::Object(_) => f.write_str("PluginFactory::Object"),
        }
    }
}

impl PluginFactory {
    /// Factory from an async registration closure
    pub fn function<F, Fut>(f: F) -> Self
    where
        F: Fn(PluginApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::Function(Arc::new(move |api| f(api).boxed()))
    }

    /// Factory from a [`Plugin`] object
    pub fn object(plugin: impl Plugin + 'static) -> Self {
        Self::Object(Arc::new(plugin))
    }

    /// Resolve into the canonical call shape
    #[must_use]
    pub fn resolve(self) -> Arc<dyn Plugin> {
        match self {
            Self::Function(register) => Arc::new(FnPlugin(register)),
            Self::Object(plugin) => plugin,
        }
    }
}

struct FnPlugin(RegisterFn);

#[async_trait]
impl Plugin for FnPlugin {
    async fn register(&self, api: PluginApi) -> anyhow::Result<()> {
        (self.0)(api).await
    }
}

/// Run `plugin.register`, converting a panic into an error
pub(crate) async fn invoke_register(plugin: &Arc<dyn Plugin>, api: PluginApi) -> anyhow::Result<()> {
    match AssertUnwindSafe(async { plugin.register(api).await }).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("plugin panicked during registration")),
    }
}

/// A plugin compiled into the gateway binary
#[derive(Debug, Clone)]
pub struct BuiltinPlugin {
    pub manifest: PluginManifest,
    pub factory: PluginFactory,
}

impl BuiltinPlugin {
    #[must_use]
    pub fn new(id: &str, name: &str, factory: PluginFactory) -> Self {
        Self {
            manifest: PluginManifest::builtin(id, name),
            factory,
        }
    }
}
