//! Export manager - fans artifact deltas out to sink exporters
//!
//! The manager owns one task per exporter, each fed by its own capacity-1
//! channel. A batch is forwarded to every exporter in registration order;
//! a slow sink therefore backpressures the whole pipeline rather than
//! dropping deltas, which is what keeps the reference counts truthful.

pub(crate) mod cache;
pub mod file;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use scout_core::{Artifact, Selector};

use crate::error::{EngineError, Result};
use crate::pipeline::Exporter;

pub use file::{FileExporter, StdoutExporter};

/// Export stage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// File sinks; may be empty only when the stdout exporter is enabled
    #[serde(default)]
    pub file: Vec<FileConfig>,
}

/// One file sink
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    /// Selector choosing which artifacts this sink receives; mandatory
    #[serde(default)]
    pub selector: String,
    /// Output path, unique across sinks; mandatory
    #[serde(default)]
    pub filename: String,
}

pub(crate) fn validate_config(cfg: &Config, stdout_enabled: bool) -> Result<()> {
    if cfg.file.is_empty() && !stdout_enabled {
        return Err(EngineError::Config("empty config".to_string()));
    }
    let mut seen = std::collections::HashSet::new();
    for (i, file) in cfg.file.iter().enumerate() {
        if file.selector.is_empty() {
            return Err(EngineError::Config(format!(
                "'file->selector' not set [{}]",
                i + 1
            )));
        }
        if file.filename.is_empty() {
            return Err(EngineError::Config(format!(
                "'file->filename' not set [{}]",
                i + 1
            )));
        }
        if !seen.insert(file.filename.as_str()) {
            return Err(EngineError::Config(format!(
                "duplicate filename: '{}'",
                file.filename
            )));
        }
    }
    Ok(())
}

/// Owns the configured exporters and fans batches out to them
pub struct ExportManager {
    exporters: Vec<Box<dyn Exporter>>,
}

impl ExportManager {
    /// Build the exporter set from configuration
    ///
    /// `stdout_enabled` is the process-wide "running in a terminal" flag,
    /// computed once at startup and passed in rather than read here.
    pub fn new(cfg: &Config, stdout_enabled: bool) -> Result<Self> {
        validate_config(cfg, stdout_enabled)?;

        let mut exporters: Vec<Box<dyn Exporter>> = Vec::with_capacity(cfg.file.len() + 1);
        for file in &cfg.file {
            let selector = Selector::parse(&file.selector)?;
            exporters.push(Box::new(FileExporter::new(selector, &file.filename)));
        }
        if stdout_enabled {
            exporters.push(Box::new(StdoutExporter::new()));
        }
        Ok(Self { exporters })
    }

    #[cfg(test)]
    fn with_exporters(exporters: Vec<Box<dyn Exporter>>) -> Self {
        Self { exporters }
    }
}

#[async_trait]
impl Exporter for ExportManager {
    async fn export(
        self: Box<Self>,
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<Vec<Artifact>>,
    ) {
        info!(exporters = self.exporters.len(), "export manager started");

        let mut handles = Vec::with_capacity(self.exporters.len());
        let mut senders = Vec::with_capacity(self.exporters.len());
        for exporter in self.exporters {
            let (tx, exporter_rx) = mpsc::channel(1);
            senders.push(tx);
            handles.push(tokio::spawn(exporter.export(cancel.clone(), exporter_rx)));
        }

        'outer: loop {
            let artifacts = tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(artifacts) => artifacts,
                    None => break,
                },
            };
            for tx in &senders {
                tokio::select! {
                    _ = cancel.cancelled() => break 'outer,
                    sent = tx.send(artifacts.clone()) => if sent.is_err() { continue },
                }
            }
        }

        drop(senders);
        for handle in handles {
            let _ = handle.await;
        }
        info!("export manager stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use scout_core::Tags;

    fn config(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn validate_accepts_unique_files() {
        let cfg = config("file: [{selector: a, filename: /tmp/a}, {selector: b, filename: /tmp/b}]");
        assert!(validate_config(&cfg, false).is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_filenames() {
        let cfg = config("file: [{selector: a, filename: /tmp/a}, {selector: b, filename: /tmp/a}]");
        assert!(validate_config(&cfg, false).is_err());
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert!(validate_config(&config("file: [{filename: /tmp/a}]"), false).is_err());
        assert!(validate_config(&config("file: [{selector: a}]"), false).is_err());
    }

    #[test]
    fn empty_file_list_needs_stdout() {
        let cfg = Config::default();
        assert!(validate_config(&cfg, false).is_err());
        assert!(validate_config(&cfg, true).is_ok());
    }

    /// Exporter double that records every batch it receives
    struct CapturingExporter {
        seen: mpsc::UnboundedSender<Vec<Artifact>>,
    }

    #[async_trait]
    impl Exporter for CapturingExporter {
        async fn export(
            self: Box<Self>,
            cancel: CancellationToken,
            mut rx: mpsc::Receiver<Vec<Artifact>>,
        ) {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    maybe = rx.recv() => match maybe {
                        Some(batch) => { let _ = self.seen.send(batch); }
                        None => return,
                    },
                }
            }
        }
    }

    #[tokio::test]
    async fn fans_each_batch_to_every_exporter() {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let manager = ExportManager::with_exporters(vec![
            Box::new(CapturingExporter { seen: a_tx }),
            Box::new(CapturingExporter { seen: b_tx }),
        ]);

        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Box::new(manager).export(cancel.clone(), rx));

        let batch = vec![Artifact {
            conf: "X".to_string(),
            tags: Tags::new(),
            stale: false,
        }];
        tx.send(batch.clone()).await.unwrap();

        assert_eq!(a_rx.recv().await.unwrap(), batch);
        assert_eq!(b_rx.recv().await.unwrap(), batch);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stops_after_all_exporters_return() {
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let manager =
            ExportManager::with_exporters(vec![Box::new(CapturingExporter { seen: a_tx })]);

        let (_tx, rx) = mpsc::channel::<Vec<Artifact>>(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Box::new(manager).export(cancel.clone(), rx));

        cancel.cancel();
        // returns only once every child exporter has exited
        handle.await.unwrap();
    }
}
