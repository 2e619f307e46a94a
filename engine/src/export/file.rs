//! File and stdout exporters
//!
//! Both keep a reference-counted cache of live conf strings and flush on a
//! fixed one second cadence, never per delta. The file exporter rewrites
//! its whole file on each flush; the stdout exporter prints a banner and
//! the current lines.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scout_core::{Artifact, Selector};

use crate::export::cache::ConfCache;
use crate::pipeline::Exporter;

/// Flush cadence shared by all exporters
pub(crate) const EXPORT_EVERY: Duration = Duration::from_secs(1);

/// Writes the live artifact set to a file, rewriting it on each flush
pub struct FileExporter {
    selector: Selector,
    path: PathBuf,
    cache: ConfCache,
    dump: bool,
}

impl FileExporter {
    /// Create an exporter for `path`, accepting artifacts matching `selector`
    pub fn new(selector: Selector, path: impl Into<PathBuf>) -> Self {
        Self {
            selector,
            path: path.into(),
            cache: ConfCache::new(),
            dump: false,
        }
    }

    fn process(&mut self, artifacts: Vec<Artifact>) {
        for artifact in &artifacts {
            if !self.selector.matches(&artifact.tags) {
                continue;
            }
            if self.cache.put(artifact) {
                self.dump = true;
            }
        }
    }

    fn flush(&mut self) {
        if !self.dump || self.cache.is_empty() {
            return;
        }
        let mut out = String::new();
        for conf in self.cache.confs() {
            out.push_str(conf);
            out.push('\n');
        }
        if let Err(err) = std::fs::write(&self.path, out) {
            warn!(file = %self.path.display(), error = %err, "failed to write file");
            return;
        }
        self.dump = false;
        info!(
            count = self.cache.len(),
            file = %self.path.display(),
            "wrote config(s) to file"
        );
    }
}

#[async_trait]
impl Exporter for FileExporter {
    async fn export(
        mut self: Box<Self>,
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<Vec<Artifact>>,
    ) {
        info!(file = %self.path.display(), "file exporter started");
        let mut tick = tokio::time::interval(EXPORT_EVERY);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(artifacts) => self.process(artifacts),
                    None => break,
                },
                _ = tick.tick() => self.flush(),
            }
        }
        info!(file = %self.path.display(), "file exporter stopped");
    }
}

/// Prints the live artifact set to stdout on each flush
///
/// Registered only when the process runs in a terminal; matches every
/// artifact regardless of tags.
pub struct StdoutExporter {
    cache: ConfCache,
    dump: bool,
}

impl StdoutExporter {
    /// Create a stdout exporter
    pub fn new() -> Self {
        Self {
            cache: ConfCache::new(),
            dump: false,
        }
    }

    fn process(&mut self, artifacts: Vec<Artifact>) {
        for artifact in &artifacts {
            if self.cache.put(artifact) {
                self.dump = true;
            }
        }
    }

    fn flush(&mut self) {
        if !self.dump || self.cache.is_empty() {
            return;
        }
        self.dump = false;

        let mut stdout = std::io::stdout().lock();
        let banner = format!(
            "-----------------------CONFIGURATIONS({})-----------------------",
            self.cache.len()
        );
        let _ = writeln!(stdout, "{banner}");
        for conf in self.cache.confs() {
            let _ = writeln!(stdout, "{conf}");
        }
    }
}

impl Default for StdoutExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exporter for StdoutExporter {
    async fn export(
        mut self: Box<Self>,
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<Vec<Artifact>>,
    ) {
        let mut tick = tokio::time::interval(EXPORT_EVERY);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                maybe = rx.recv() => match maybe {
                    Some(artifacts) => self.process(artifacts),
                    None => return,
                },
                _ = tick.tick() => self.flush(),
            }
        }
    }
}
