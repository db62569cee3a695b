//! Plugins compiled into the gateway

pub mod hot_reload;

pub use hot_reload::HotReloadHandle;

use super::factory::BuiltinPlugin;

/// The builtins every gateway loads
#[must_use]
pub fn default_builtins(hot_reload: &HotReloadHandle) -> Vec<BuiltinPlugin> {
    vec![hot_reload::plugin(hot_reload)]
}
