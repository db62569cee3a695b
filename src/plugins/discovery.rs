//! Plugin discovery - scan plugin roots for `plugin.json` manifests

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use super::manifest::{MANIFEST_FILE, PluginManifest};
use crate::config::Config;

/// Where a plugin was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginSource {
    /// A directory listed in `plugins.dirs`
    Config,
    /// The global user plugin directory
    Global,
    /// Compiled into the gateway binary
    Builtin,
}

impl PluginSource {
    /// Whether the plugin was loaded from disk
    #[must_use]
    pub const fn is_external(self) -> bool {
        !matches!(self, Self::Builtin)
    }
}

impl fmt::Display for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => write!(f, "config"),
            Self::Global => write!(f, "global"),
            Self::Builtin => write!(f, "builtin"),
        }
    }
}

/// A plugin directory with a valid manifest
#[derive(Debug, Clone)]
pub struct DiscoveryCandidate {
    pub manifest: PluginManifest,
    /// Absolute plugin directory
    pub dir: PathBuf,
    pub source: PluginSource,
}

/// Plugin roots in precedence order: configured dirs, then the global dir
#[must_use]
pub fn plugin_roots(config: &Config) -> Vec<(PathBuf, PluginSource)> {
    config
        .plugins
        .dirs
        .iter()
        .map(|d| (d.clone(), PluginSource::Config))
        .chain(std::iter::once((
            config.plugins.global_dir.clone(),
            PluginSource::Global,
        )))
        .collect()
}

/// Scan plugin roots for manifests
///
/// Looks for `plugin.json` in the immediate subdirectories of each root.
/// Candidates keep root order, then child order (sorted by directory name),
/// which is the precedence order consumed by the loader. Directories without
/// a manifest are ignored; invalid manifests are skipped with a warning.
#[must_use]
pub fn discover(roots: &[(PathBuf, PluginSource)]) -> Vec<DiscoveryCandidate> {
    let mut candidates = Vec::new();

    for (root, source) in roots {
        if !root.is_dir() {
            tracing::debug!(path = %root.display(), "plugin directory does not exist, skipping");
            continue;
        }

        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %root.display(), error = %e, "failed to read plugin directory");
                continue;
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let manifest_path = dir.join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                tracing::debug!(path = %dir.display(), "no plugin.json, skipping directory");
                continue;
            }

            match PluginManifest::load(&manifest_path) {
                Ok(manifest) => {
                    let dir = std::path::absolute(&dir).unwrap_or(dir);
                    tracing::debug!(
                        plugin_id = %manifest.id,
                        source = %source,
                        path = %dir.display(),
                        "discovered plugin"
                    );
                    candidates.push(DiscoveryCandidate {
                        manifest,
                        dir,
                        source: *source,
                    });
                }
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "skipping plugin with invalid manifest");
                }
            }
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn write_plugin(root: &Path, dir: &str, manifest: &str) -> PathBuf {
        let plugin_dir = root.join(dir);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(plugin_dir.join(MANIFEST_FILE), manifest).unwrap();
        plugin_dir
    }

    #[test]
    fn discover_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let results = discover(&[(dir.path().to_path_buf(), PluginSource::Config)]);
        assert!(results.is_empty());
    }

    #[test]
    fn discover_valid_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = write_plugin(
            dir.path(),
            "my-plugin",
            r#"{"id":"test","name":"Test Plugin","main":"index.js"}"#,
        );

        let results = discover(&[(dir.path().to_path_buf(), PluginSource::Global)]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].manifest.id, "test");
        assert_eq!(results[0].source, PluginSource::Global);
        assert!(results[0].dir.ends_with(plugin_dir.file_name().unwrap()));
    }

    #[test]
    fn skip_invalid_and_missing_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "bad", "not valid json");
        write_plugin(dir.path(), "no-main", r#"{"id":"x","name":"X","main":""}"#);
        std::fs::create_dir(dir.path().join("no-manifest")).unwrap();
        std::fs::write(dir.path().join("stray-file.json"), "{}").unwrap();
        write_plugin(dir.path(), "good", r#"{"id":"good","name":"G","main":"a.sh"}"#);

        let results = discover(&[(dir.path().to_path_buf(), PluginSource::Config)]);
        let ids: Vec<&str> = results.iter().map(|c| c.manifest.id.as_str()).collect();
        assert_eq!(ids, vec!["good"]);
    }

    #[test]
    fn skip_nonexistent_root() {
        let results = discover(&[(PathBuf::from("/nonexistent/path"), PluginSource::Config)]);
        assert!(results.is_empty());
    }

    #[test]
    fn preserves_root_then_child_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write_plugin(second.path(), "a", r#"{"id":"global-a","name":"A","main":"a"}"#);
        write_plugin(first.path(), "b", r#"{"id":"config-b","name":"B","main":"b"}"#);
        write_plugin(first.path(), "a", r#"{"id":"config-a","name":"A","main":"a"}"#);

        let results = discover(&[
            (first.path().to_path_buf(), PluginSource::Config),
            (second.path().to_path_buf(), PluginSource::Global),
        ]);
        let ids: Vec<&str> = results.iter().map(|c| c.manifest.id.as_str()).collect();
        assert_eq!(ids, vec!["config-a", "config-b", "global-a"]);
    }

    #[test]
    fn roots_put_configured_dirs_first() {
        let mut config = Config::default();
        config.plugins.dirs = vec![PathBuf::from("/one"), PathBuf::from("/two")];
        let roots = plugin_roots(&config);
        assert_eq!(roots.len(), 3);
        assert_eq!(roots[0], (PathBuf::from("/one"), PluginSource::Config));
        assert_eq!(roots[2].1, PluginSource::Global);
    }
}
