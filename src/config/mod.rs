//! Configuration management for the Plexus gateway

pub mod file;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use file::{PlexusConfigFile, load_config_file};

/// Default HTTP API port
pub const DEFAULT_PORT: u16 = 18790;

/// Default debounce window for plugin file changes
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP API server configuration
    pub api: ApiConfig,

    /// Plugin runtime configuration
    pub plugins: PluginsConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Port to listen on
    pub port: u16,

    /// Bearer token required by protected endpoints (from `PLEXUS_API_KEY`)
    pub api_key: Option<String>,
}

/// Outcome of checking a bearer token against the configured key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// No key configured
    Open,
    Granted,
    Missing,
    Invalid,
}

impl Access {
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Open | Self::Granted)
    }
}

impl ApiConfig {
    /// Check a presented bearer token against `api_key`
    #[must_use]
    pub fn check_token(&self, token: Option<&str>) -> Access {
        match (self.api_key.as_deref(), token) {
            (None, _) => Access::Open,
            (Some(expected), Some(token)) if token == expected => Access::Granted,
            (Some(_), Some(_)) => Access::Invalid,
            (Some(_), None) => Access::Missing,
        }
    }
}

/// Plugin discovery configuration
#[derive(Debug, Clone)]
pub struct PluginsConfig {
    /// Configured plugin roots, highest precedence first
    pub dirs: Vec<PathBuf>,

    /// Global user plugin directory (`~/.plexus/plugins`)
    pub global_dir: PathBuf,

    /// Plugin ids that are never loaded
    pub disabled: Vec<String>,

    /// Per-plugin configuration, exposed to each plugin as its `plugin_config`
    pub config: HashMap<String, serde_json::Value>,

    /// Hot-reload watcher settings
    pub watch: WatchConfig,
}

/// Hot-reload watcher settings
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Watch every external plugin directory on startup
    pub enabled: bool,

    /// Quiet period before a burst of changes triggers a reload
    pub debounce: Duration,

    /// File extensions that count as plugin source changes
    pub extensions: Vec<String>,

    /// Path components that never trigger a reload
    pub ignore: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            extensions: ["js", "ts", "py", "rb", "sh", "json"]
                .into_iter()
                .map(String::from)
                .collect(),
            ignore: ["node_modules", ".git", "target", "dist", "build"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            global_dir: default_global_plugin_dir(),
            disabled: Vec::new(),
            config: HashMap::new(),
            watch: WatchConfig::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                port: DEFAULT_PORT,
                api_key: None,
            },
            plugins: PluginsConfig::default(),
        }
    }
}

impl PluginsConfig {
    /// Whether a plugin id has been disabled in config
    #[must_use]
    pub fn is_disabled(&self, id: &str) -> bool {
        self.disabled.iter().any(|d| d == id)
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    #[must_use]
    pub fn load() -> Self {
        Self::from_sources(load_config_file(), |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed config file and an environment lookup
    ///
    /// `env` is consulted for `PLEXUS_PORT`, `PLEXUS_API_KEY`,
    /// `PLEXUS_PLUGIN_DIRS` and `PLEXUS_PLUGINS_WATCH`.
    pub fn from_sources(fc: PlexusConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let api = ApiConfig {
            port: env("PLEXUS_PORT")
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(DEFAULT_PORT),
            api_key: env("PLEXUS_API_KEY").or(fc.server.api_key),
        };

        // Env dirs take precedence over file dirs
        let mut dirs: Vec<PathBuf> = env("PLEXUS_PLUGIN_DIRS")
            .map(|v| std::env::split_paths(&v).collect())
            .unwrap_or_default();
        dirs.extend(fc.plugins.dirs.iter().map(|d| expand_home(d)));

        let defaults = WatchConfig::default();
        let watch = WatchConfig {
            enabled: env("PLEXUS_PLUGINS_WATCH")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .or(fc.plugins.watch.enabled)
                .unwrap_or(defaults.enabled),
            debounce: fc
                .plugins
                .watch
                .debounce_ms
                .map_or(defaults.debounce, Duration::from_millis),
            extensions: fc
                .plugins
                .watch
                .extensions
                .map(|exts| {
                    exts.into_iter()
                        .map(|e| e.trim_start_matches('.').to_string())
                        .collect()
                })
                .unwrap_or(defaults.extensions),
            ignore: fc.plugins.watch.ignore.unwrap_or(defaults.ignore),
        };

        let plugins = PluginsConfig {
            dirs,
            global_dir: fc
                .plugins
                .global_dir
                .as_deref()
                .map_or_else(default_global_plugin_dir, expand_home),
            disabled: fc.plugins.disabled,
            config: fc.plugins.config,
            watch,
        };

        Self { api, plugins }
    }
}

/// Default global plugin directory: `~/.plexus/plugins`
fn default_global_plugin_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".plexus/plugins"),
        |d| d.home_dir().join(".plexus").join("plugins"),
    )
}

/// Expand a leading `~` to the user's home directory
#[must_use]
pub fn expand_home(path: &str) -> PathBuf {
    let Some(rest) = path.strip_prefix('~') else {
        return PathBuf::from(path);
    };
    let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) else {
        return PathBuf::from(path);
    };
    let rest = rest.trim_start_matches(['/', '\\']);
    if rest.is_empty() {
        home
    } else {
        home.join(Path::new(rest))
    }
}
