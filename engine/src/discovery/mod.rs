//! Discovery aggregator - multiplexes platform discoverers into batches
//!
//! Every platform discoverer feeds a shared cache of the latest group per
//! source. A capacity-1 signal channel marks the cache dirty; a fixed
//! cadence ticker releases `cache.as_list()` downstream. If the receiver is
//! not ready the cache is retained and the signal re-armed, so a slow
//! pipeline only coarsens the batching, it never loses the newest snapshot.

pub mod kubernetes;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::info;

use scout_core::Group;

use crate::error::{EngineError, Result};
use crate::pipeline::Discoverer;

/// How often the aggregator attempts to release a batch
const SEND_EVERY: Duration = Duration::from_secs(5);

/// Discovery stage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Kubernetes discoverers; at least one
    #[serde(default)]
    pub k8s: Vec<kubernetes::Config>,
}

/// Latest group per source, shared between discoverer runners and the ticker
#[derive(Debug, Default)]
struct GroupCache {
    items: HashMap<String, Group>,
}

impl GroupCache {
    fn update(&mut self, groups: Vec<Group>) {
        for group in groups {
            self.items.insert(group.source.clone(), group);
        }
    }

    fn take_list(&mut self) -> Vec<Group> {
        self.items.drain().map(|(_, group)| group).collect()
    }

    fn restore(&mut self, groups: Vec<Group>) {
        for group in groups {
            self.items.insert(group.source.clone(), group);
        }
    }
}

/// Runs the configured discoverers and batches their output
pub struct DiscoveryManager {
    discoverers: Vec<Box<dyn Discoverer>>,
}

impl DiscoveryManager {
    /// Build one discoverer per configured entry
    pub async fn new(cfg: &Config) -> Result<Self> {
        if cfg.k8s.is_empty() {
            return Err(EngineError::Config("empty config".to_string()));
        }
        let mut discoverers: Vec<Box<dyn Discoverer>> = Vec::new();
        for k8s_cfg in &cfg.k8s {
            discoverers.push(Box::new(kubernetes::KubeDiscovery::new(k8s_cfg).await?));
        }
        Ok(Self { discoverers })
    }

    /// Assemble from already-built discoverers
    pub fn with_discoverers(discoverers: Vec<Box<dyn Discoverer>>) -> Self {
        Self { discoverers }
    }
}

#[async_trait]
impl Discoverer for DiscoveryManager {
    async fn discover(self: Box<Self>, cancel: CancellationToken, tx: mpsc::Sender<Vec<Group>>) {
        info!(discoverers = self.discoverers.len(), "discovery manager started");

        let cache = Arc::new(Mutex::new(GroupCache::default()));
        // capacity-1 channel used as an edge-triggered dirty flag
        let (signal_tx, signal_rx) = mpsc::channel::<()>(1);

        let mut handles = Vec::with_capacity(self.discoverers.len() + 1);
        for discoverer in self.discoverers {
            handles.push(tokio::spawn(run_discoverer(
                cancel.clone(),
                discoverer,
                Arc::clone(&cache),
                signal_tx.clone(),
            )));
        }
        handles.push(tokio::spawn(run_ticker(
            cancel.clone(),
            cache,
            signal_tx,
            signal_rx,
            tx,
        )));

        for handle in handles {
            let _ = handle.await;
        }
        info!("discovery manager stopped");
    }
}

async fn run_discoverer(
    cancel: CancellationToken,
    discoverer: Box<dyn Discoverer>,
    cache: Arc<Mutex<GroupCache>>,
    signal: mpsc::Sender<()>,
) {
    let (updates_tx, mut updates_rx) = mpsc::channel(1);
    let child = tokio::spawn(discoverer.discover(cancel.clone(), updates_tx));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = updates_rx.recv() => match maybe {
                Some(groups) => {
                    cache.lock().update(groups);
                    let _ = signal.try_send(());
                }
                None => break,
            },
        }
    }
    let _ = child.await;
}

async fn run_ticker(
    cancel: CancellationToken,
    cache: Arc<Mutex<GroupCache>>,
    signal_tx: mpsc::Sender<()>,
    mut signal_rx: mpsc::Receiver<()>,
    tx: mpsc::Sender<Vec<Group>>,
) {
    let mut tick = tokio::time::interval(SEND_EVERY);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the interval's first tick completes immediately; skip it so the
    // first release happens one full period after startup
    tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {
                if signal_rx.try_recv().is_ok() {
                    try_send(&cache, &signal_tx, &tx);
                }
            }
        }
    }
}

fn try_send(
    cache: &Mutex<GroupCache>,
    signal: &mpsc::Sender<()>,
    tx: &mpsc::Sender<Vec<Group>>,
) {
    let mut cache = cache.lock();
    let groups = cache.take_list();
    match tx.try_send(groups) {
        Ok(()) => {}
        Err(TrySendError::Full(groups)) | Err(TrySendError::Closed(groups)) => {
            cache.restore(groups);
            let _ = signal.try_send(());
        }
    }
}
