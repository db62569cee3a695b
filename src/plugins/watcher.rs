//! File watcher that hot-reloads plugins on source changes with debouncing

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher, recommended_watcher};
use tokio::sync::{mpsc, oneshot};

use super::reloader::Reload;
use crate::config::WatchConfig;
use crate::{Error, Result};

/// Filtering and debounce settings
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub debounce: Duration,
    /// Extensions (without the dot) that count as source changes
    pub extensions: Vec<String>,
    /// Path components below the watched root that never trigger a reload
    pub ignore: Vec<String>,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

impl From<&WatchConfig> for WatcherOptions {
    fn from(config: &WatchConfig) -> Self {
        Self {
            debounce: config.debounce,
            extensions: config.extensions.clone(),
            ignore: config.ignore.clone(),
        }
    }
}

/// Whether a change to `path` under `root` should trigger a reload
#[must_use]
pub fn should_reload(root: &Path, path: &Path, options: &WatcherOptions) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);

    let ignored = relative.components().any(|c| match c {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|name| options.ignore.iter().any(|i| i == name)),
        _ => false,
    });
    if ignored {
        return false;
    }

    relative
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| options.extensions.iter().any(|allowed| allowed == ext))
}

struct WatchEntry {
    path: PathBuf,
    changes: mpsc::UnboundedSender<PathBuf>,
    /// Dropping this ends the debounce loop once any running reload returns
    _stop: oneshot::Sender<()>,
    _watcher: RecommendedWatcher,
}

/// Watches plugin directories and triggers reloads
pub struct ReloadWatcher {
    reloader: Arc<dyn Reload>,
    options: WatcherOptions,
    entries: Mutex<HashMap<String, WatchEntry>>,
}

impl std::fmt::Debug for ReloadWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadWatcher")
            .field("options", &self.options)
            .field("watched", &self.watched())
            .finish_non_exhaustive()
    }
}

impl ReloadWatcher {
    #[must_use]
    pub fn new(reloader: Arc<dyn Reload>, options: WatcherOptions) -> Self {
        Self {
            reloader,
            options,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, WatchEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start watching `path` recursively on behalf of `plugin_id`
    ///
    /// The path is canonicalized first, matching the paths the OS reports.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the plugin is already watched, the path does not
    /// exist, or the OS watcher cannot be created
    pub fn watch(&self, plugin_id: &str, path: &Path) -> Result<()> {
        if self.entries().contains_key(plugin_id) {
            return Err(Error::Watch(format!("already watching plugin {plugin_id}")));
        }
        if !path.exists() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        let path = path.canonicalize()?;

        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();
        let (stop_tx, stop_rx) = oneshot::channel();

        let mut watcher = {
            let tx = tx.clone();
            let root = path.clone();
            let options = self.options.clone();
            let plugin_id = plugin_id.to_string();
            recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    for changed in event.paths {
                        if should_reload(&root, &changed, &options) {
                            // Receiver gone means the plugin was unwatched
                            let _ = tx.send(changed);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(plugin_id = %plugin_id, error = %e, "file watcher error");
                }
            })?
        };
        watcher.watch(&path, RecursiveMode::Recursive)?;

        tokio::spawn(debounce_loop(
            plugin_id.to_string(),
            rx,
            stop_rx,
            Arc::clone(&self.reloader),
            self.options.debounce,
        ));

        let mut entries = self.entries();
        if entries.contains_key(plugin_id) {
            return Err(Error::Watch(format!("already watching plugin {plugin_id}")));
        }
        entries.insert(
            plugin_id.to_string(),
            WatchEntry {
                path: path.clone(),
                changes: tx,
                _stop: stop_tx,
                _watcher: watcher,
            },
        );
        drop(entries);

        tracing::info!(plugin_id = %plugin_id, path = %path.display(), "watching plugin for changes");
        Ok(())
    }

    /// Stop watching a plugin, cancelling a reload still in its debounce
    /// window
    ///
    /// A reload that has already started runs to completion. Returns `false`
    /// if the plugin was not watched.
    pub fn unwatch(&self, plugin_id: &str) -> bool {
        if self.entries().remove(plugin_id).is_none() {
            return false;
        }
        tracing::info!(plugin_id = %plugin_id, "stopped watching plugin");
        true
    }

    /// Ids of watched plugins, sorted
    #[must_use]
    pub fn watched(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Path being watched for `plugin_id`
    #[must_use]
    pub fn watched_path(&self, plugin_id: &str) -> Option<PathBuf> {
        self.entries().get(plugin_id).map(|e| e.path.clone())
    }

    /// Stop every watcher
    pub fn stop_all(&self) {
        let entries: Vec<(String, WatchEntry)> = self.entries().drain().collect();
        for (plugin_id, _entry) in entries {
            tracing::debug!(plugin_id = %plugin_id, "stopped watching plugin");
        }
    }

    /// Feed a change for `plugin_id` through the same filter as OS events
    ///
    /// Returns whether the change was accepted.
    pub(crate) fn handle_change(&self, plugin_id: &str, path: &Path) -> bool {
        let entries = self.entries();
        let Some(entry) = entries.get(plugin_id) else {
            return false;
        };
        if !should_reload(&entry.path, path, &self.options) {
            return false;
        }
        entry.changes.send(path.to_path_buf()).is_ok()
    }
}

/// Wait for a change, then for a quiet period, then reload once
///
/// `stop` is only watched while waiting, never during a reload.
async fn debounce_loop(
    plugin_id: String,
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    mut stop: oneshot::Receiver<()>,
    reloader: Arc<dyn Reload>,
    debounce: Duration,
) {
    loop {
        let first = tokio::select! {
            _ = &mut stop => return,
            change = rx.recv() => match change {
                Some(path) => path,
                None => return,
            },
        };
        tracing::debug!(plugin_id = %plugin_id, path = %first.display(), "plugin change detected, starting debounce");

        loop {
            tokio::select! {
                _ = &mut stop => {
                    tracing::debug!(plugin_id = %plugin_id, "pending reload cancelled");
                    return;
                }
                change = tokio::time::timeout(debounce, rx.recv()) => match change {
                    Ok(Some(path)) => {
                        tracing::trace!(plugin_id = %plugin_id, path = %path.display(), "more changes during debounce, resetting timer");
                    }
                    Ok(None) => return,
                    Err(_) => break,
                },
            }
        }

        let result = reloader.reload(&plugin_id).await;
        if result.success {
            tracing::info!(plugin_id = %plugin_id, duration_ms = result.duration_ms, "hot reload complete");
        } else {
            tracing::error!(
                plugin_id = %plugin_id,
                error = result.error.as_deref().unwrap_or("unknown"),
                "hot reload failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::plugins::reloader::ReloadResult;

    struct CountingReloader {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reload for CountingReloader {
        async fn reload(&self, plugin_id: &str) -> ReloadResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ReloadResult {
                success: true,
                plugin_id: plugin_id.to_string(),
                error: None,
                timestamp: chrono::Utc::now(),
                duration_ms: 0,
            }
        }
    }

    fn options(debounce_ms: u64) -> WatcherOptions {
        WatcherOptions {
            debounce: Duration::from_millis(debounce_ms),
            ..WatcherOptions::default()
        }
    }

    fn counting() -> Arc<CountingReloader> {
        Arc::new(CountingReloader {
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn filter_by_extension_and_ignore_list() {
        let opts = WatcherOptions::default();
        let root = Path::new("/work/build/plugins/echo");

        assert!(should_reload(root, &root.join("index.js"), &opts));
        assert!(should_reload(root, &root.join("lib/util.ts"), &opts));
        assert!(!should_reload(root, &root.join("README.md"), &opts));
        assert!(!should_reload(root, &root.join("node_modules/x/index.js"), &opts));
        assert!(!should_reload(root, &root.join(".git/HEAD"), &opts));
        assert!(!should_reload(root, &root.join("Makefile"), &opts));
    }

    #[tokio::test]
    async fn burst_of_changes_triggers_one_reload() {
        let dir = tempfile::tempdir().unwrap();
        let reloader = counting();
        let watcher = ReloadWatcher::new(reloader.clone(), options(50));
        assert_ok!(watcher.watch("echo", dir.path()));

        let file = dir.path().join("index.js");
        for _ in 0..3 {
            assert!(watcher.handle_change("echo", &file));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(reloader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ignored_changes_do_not_reload() {
        let dir = tempfile::tempdir().unwrap();
        let reloader = counting();
        let watcher = ReloadWatcher::new(reloader.clone(), options(20));
        assert_ok!(watcher.watch("echo", dir.path()));

        assert!(!watcher.handle_change("echo", &dir.path().join("notes.txt")));
        assert!(!watcher.handle_change("other", &dir.path().join("index.js")));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reloader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_watch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = ReloadWatcher::new(counting(), options(20));

        assert_ok!(watcher.watch("echo", dir.path()));
        let err = assert_err!(watcher.watch("echo", dir.path()));
        assert!(err.to_string().contains("already watching"));
        assert_eq!(watcher.watched(), vec!["echo"]);
    }

    #[tokio::test]
    async fn unwatch_cancels_pending_reload() {
        let dir = tempfile::tempdir().unwrap();
        let reloader = counting();
        let watcher = ReloadWatcher::new(reloader.clone(), options(100));
        assert_ok!(watcher.watch("echo", dir.path()));

        assert!(watcher.handle_change("echo", &dir.path().join("index.js")));
        assert!(watcher.unwatch("echo"));
        assert!(!watcher.unwatch("echo"));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(reloader.calls.load(Ordering::SeqCst), 0);
        assert!(watcher.watched().is_empty());
    }

    #[tokio::test]
    async fn watch_missing_path_fails() {
        let watcher = ReloadWatcher::new(counting(), options(20));
        assert_err!(watcher.watch("echo", Path::new("/nonexistent/plugin")));
    }

    /// Reload that takes a while and counts starts and completions
    struct SlowReloader {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl Reload for SlowReloader {
        async fn reload(&self, plugin_id: &str) -> ReloadResult {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            ReloadResult {
                success: true,
                plugin_id: plugin_id.to_string(),
                error: None,
                timestamp: chrono::Utc::now(),
                duration_ms: 200,
            }
        }
    }

    fn slow() -> Arc<SlowReloader> {
        Arc::new(SlowReloader {
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn unwatch_lets_running_reload_finish() {
        let dir = tempfile::tempdir().unwrap();
        let reloader = slow();
        let watcher = ReloadWatcher::new(reloader.clone(), options(20));
        assert_ok!(watcher.watch("echo", dir.path()));

        assert!(watcher.handle_change("echo", &dir.path().join("index.js")));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reloader.started.load(Ordering::SeqCst), 1);

        assert!(watcher.unwatch("echo"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(reloader.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_all_lets_running_reload_finish() {
        let dir = tempfile::tempdir().unwrap();
        let reloader = slow();
        let watcher = ReloadWatcher::new(reloader.clone(), options(20));
        assert_ok!(watcher.watch("echo", dir.path()));

        assert!(watcher.handle_change("echo", &dir.path().join("index.js")));
        tokio::time::sleep(Duration::from_millis(100)).await;

        watcher.stop_all();
        assert!(watcher.watched().is_empty());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(reloader.started.load(Ordering::SeqCst), 1);
        assert_eq!(reloader.finished.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_root_is_resolved_before_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("build").join("echo");
        std::fs::create_dir_all(&real).unwrap();
        let link = dir.path().join("echo-link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let watcher = ReloadWatcher::new(counting(), options(20));
        assert_ok!(watcher.watch("echo", &link));

        let real = real.canonicalize().unwrap();
        assert_eq!(watcher.watched_path("echo"), Some(real.clone()));
        // "build" is an ignored name, but only below the watched root
        assert!(watcher.handle_change("echo", &real.join("index.js")));
    }
}
