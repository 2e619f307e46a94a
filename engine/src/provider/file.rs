//! Glob-watched file provider
//!
//! Paths are shell-glob patterns. The known set is refreshed on startup, on
//! filesystem notifications under the patterns' parent directories, and on
//! a fixed ticker as a safety net. The modtime cache turns repeated
//! notifications for an unchanged file into no-ops.
//!
//! Editors complicate removal detection: vim's default `backupcopy=no`
//! write is a rename followed by a create of the original path. The
//! provider waits briefly after rename events so the re-created file is
//! seen by the same refresh, and ignores create events for paths already
//! in the known set.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConfigEvent, PipelineConfig};
use crate::provider::ConfigProvider;

const REFRESH_EVERY: Duration = Duration::from_secs(60);

/// Editor rename sequences settle within this window
const RENAME_SETTLE: Duration = Duration::from_millis(100);

/// Watches files matched by shell-glob patterns
pub struct FileProvider {
    patterns: Vec<String>,
    cache: HashMap<PathBuf, SystemTime>,
    refresh_every: Duration,
}

impl FileProvider {
    /// Create a provider over the given glob patterns
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            patterns,
            cache: HashMap::new(),
            refresh_every: REFRESH_EVERY,
        }
    }

    fn list_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for pattern in &self.patterns {
            if let Ok(matches) = glob::glob(pattern) {
                files.extend(matches.flatten());
            }
        }
        files
    }

    fn path_matches(&self, path: &Path) -> bool {
        self.patterns.iter().any(|pattern| {
            glob::Pattern::new(pattern).is_ok_and(|p| p.matches_path(path))
        })
    }

    /// Re-list matching files and diff them against the known set
    fn scan(&mut self) -> Vec<ConfigEvent> {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut seen = HashSet::new();

        for file in self.list_files() {
            let meta = match std::fs::symlink_metadata(&file) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(file = %file.display(), error = %err, "unable to stat file");
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }

            seen.insert(file.clone());
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if self.cache.get(&file) == Some(&modified) {
                continue;
            }
            self.cache.insert(file.clone(), modified);

            let source = file.to_string_lossy().to_string();
            let content = match std::fs::read_to_string(&file) {
                Ok(content) => content,
                Err(err) => {
                    warn!(file = %source, error = %err, "unable to read file");
                    continue;
                }
            };
            if content.trim().is_empty() {
                removed.push(ConfigEvent::removed(source));
                continue;
            }
            match serde_yaml::from_str::<PipelineConfig>(&content) {
                Ok(pipeline) => added.push(ConfigEvent::updated(source, pipeline)),
                Err(err) => warn!(file = %source, error = %err, "unable to load file"),
            }
        }

        let gone: Vec<PathBuf> = self
            .cache
            .keys()
            .filter(|path| !seen.contains(*path))
            .cloned()
            .collect();
        for path in gone {
            self.cache.remove(&path);
            removed.push(ConfigEvent::removed(path.to_string_lossy().to_string()));
        }

        added.extend(removed);
        added
    }

    fn watch_dirs(&self, watcher: &mut RecommendedWatcher) {
        for pattern in &self.patterns {
            let dir = Path::new(pattern)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            if let Err(err) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                warn!(dir = %dir.display(), error = %err, "unable to start watching directory");
            }
        }
    }

    /// Whether a filesystem event should trigger a refresh
    fn accepts(&self, event: &notify::Event) -> bool {
        let Some(path) = event.paths.first() else {
            return false;
        };
        if matches!(event.kind, EventKind::Modify(ModifyKind::Metadata(_))) {
            return false;
        }
        if !self.path_matches(path) {
            return false;
        }
        // vim "backupcopy=no": the create follows a rename we already
        // refreshed for, and the path is still in the known set
        if matches!(event.kind, EventKind::Create(_)) && self.cache.contains_key(path) {
            return false;
        }
        true
    }

    async fn refresh(
        &mut self,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<Vec<ConfigEvent>>,
        watcher: &mut RecommendedWatcher,
    ) {
        if cancel.is_cancelled() {
            return;
        }
        let updates = self.scan();
        if !updates.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tx.send(updates) => {}
            }
        }
        self.watch_dirs(watcher);
    }
}

fn is_rename(event: &notify::Event) -> bool {
    matches!(event.kind, EventKind::Modify(ModifyKind::Name(_)))
}

#[async_trait]
impl ConfigProvider for FileProvider {
    async fn run(
        mut self: Box<Self>,
        cancel: CancellationToken,
        tx: mpsc::Sender<Vec<ConfigEvent>>,
    ) {
        info!("file config provider started");

        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel();
        let mut watcher =
            match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let _ = fs_tx.send(res);
            }) {
                Ok(watcher) => watcher,
                Err(err) => {
                    error!(error = %err, "unable to initialize filesystem watcher");
                    return;
                }
            };

        self.refresh(&cancel, &tx, &mut watcher).await;

        let mut tick = tokio::time::interval(self.refresh_every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.refresh(&cancel, &tx, &mut watcher).await,
                maybe = fs_rx.recv() => match maybe {
                    Some(Ok(event)) => {
                        if !self.accepts(&event) {
                            continue;
                        }
                        if is_rename(&event) {
                            // let the editor finish its backup sequence so
                            // one refresh sees the final state
                            tokio::time::sleep(RENAME_SETTLE).await;
                        }
                        self.refresh(&cancel, &tx, &mut watcher).await;
                    }
                    Some(Err(err)) => warn!(error = %err, "watch error event"),
                    None => break,
                },
            }
        }
        info!("file config provider stopped");
    }
}
