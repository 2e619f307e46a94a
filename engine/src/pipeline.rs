//! Pipeline - discover, tag, build, export for one configuration document
//!
//! A pipeline wires three long-lived tasks with capacity-1 channels:
//!
//! ```text
//! discover task ──disc──► process task ──exp──► export task
//! ```
//!
//! All three share one cancellation token and the pipeline returns only
//! after all three have exited, so a supervisor that awaits [`Pipeline::run`]
//! has observed full quiescence.
//!
//! The process task owns the per-source target cache. A target is rebuilt
//! only when its identity hash is new for its source; a target that
//! disappears from a subsequent snapshot (or whose whole source empties)
//! gets its cached artifacts re-emitted with `stale` set.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use scout_core::{Artifact, Group, Target};

/// Produces group snapshots onto `tx` until cancelled
#[async_trait]
pub trait Discoverer: Send + 'static {
    /// Run discovery, sending batches of groups downstream
    async fn discover(self: Box<Self>, cancel: CancellationToken, tx: mpsc::Sender<Vec<Group>>);
}

/// Applies tagging rules to a single target
pub trait Tagger: Send + 'static {
    /// Mutate the target's tags according to the rule set
    fn tag(&self, target: &mut dyn Target);
}

/// Renders a single target into configuration artifacts
pub trait Builder: Send + 'static {
    /// Render every matching rule, returning the produced artifacts
    fn build(&self, target: &dyn Target) -> Vec<Artifact>;
}

/// Consumes artifact batches from `rx` until cancelled
#[async_trait]
pub trait Exporter: Send + 'static {
    /// Run export, draining artifact batches from upstream
    async fn export(self: Box<Self>, cancel: CancellationToken, rx: mpsc::Receiver<Vec<Artifact>>);
}

// source -> target hash -> artifacts last emitted for that target.
// BTreeMap keeps stale-delta emission deterministic.
type SourceCache = HashMap<String, BTreeMap<u64, Vec<Artifact>>>;

/// One discovery pipeline
pub struct Pipeline {
    discoverer: Box<dyn Discoverer>,
    tagger: Box<dyn Tagger>,
    builder: Box<dyn Builder>,
    exporter: Box<dyn Exporter>,
}

impl Pipeline {
    /// Assemble a pipeline from its four stages
    pub fn new(
        discoverer: Box<dyn Discoverer>,
        tagger: Box<dyn Tagger>,
        builder: Box<dyn Builder>,
        exporter: Box<dyn Exporter>,
    ) -> Self {
        Self {
            discoverer,
            tagger,
            builder,
            exporter,
        }
    }

    /// Run until cancelled; returns after every stage task has exited
    pub async fn run(self, cancel: CancellationToken) {
        let Pipeline {
            discoverer,
            tagger,
            builder,
            exporter,
        } = self;

        let (disc_tx, disc_rx) = mpsc::channel(1);
        let (exp_tx, exp_rx) = mpsc::channel(1);

        let discover = tokio::spawn(discoverer.discover(cancel.clone(), disc_tx));
        let export = tokio::spawn(exporter.export(cancel.clone(), exp_rx));
        let process = tokio::spawn(process_loop(cancel, disc_rx, exp_tx, tagger, builder));

        let _ = tokio::join!(discover, process, export);
    }
}

async fn process_loop(
    cancel: CancellationToken,
    mut rx: mpsc::Receiver<Vec<Group>>,
    tx: mpsc::Sender<Vec<Artifact>>,
    tagger: Box<dyn Tagger>,
    builder: Box<dyn Builder>,
) {
    let mut cache = SourceCache::new();
    loop {
        let groups = tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = rx.recv() => match maybe {
                Some(groups) => groups,
                None => return,
            },
        };
        let artifacts = process(&mut cache, tagger.as_ref(), builder.as_ref(), groups);
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = tx.send(artifacts) => if sent.is_err() { return },
        }
    }
}

fn process(
    cache: &mut SourceCache,
    tagger: &dyn Tagger,
    builder: &dyn Builder,
    groups: Vec<Group>,
) -> Vec<Artifact> {
    let mut out = Vec::new();
    for group in groups {
        if group.targets.is_empty() {
            out.extend(handle_empty(cache, group));
        } else {
            out.extend(handle_not_empty(cache, tagger, builder, group));
        }
    }
    out
}

fn handle_empty(cache: &mut SourceCache, group: Group) -> Vec<Artifact> {
    let Some(group_cache) = cache.remove(&group.source) else {
        return Vec::new();
    };
    debug!(source = %group.source, "source is gone, withdrawing its artifacts");
    let artifacts = group_cache.into_values().flatten().collect();
    Artifact::stale_all(artifacts)
}

fn handle_not_empty(
    cache: &mut SourceCache,
    tagger: &dyn Tagger,
    builder: &dyn Builder,
    group: Group,
) -> Vec<Artifact> {
    let pre_existed = cache.contains_key(&group.source);
    let group_cache = cache.entry(group.source.clone()).or_default();

    let mut out = Vec::new();
    let mut seen = Vec::new();

    for mut target in group.targets {
        let hash = target.hash();
        seen.push(hash);

        if group_cache.contains_key(&hash) {
            continue;
        }

        tagger.tag(target.as_mut());
        let artifacts = builder.build(target.as_ref());

        group_cache.insert(hash, artifacts.clone());
        out.extend(artifacts);
    }

    if !pre_existed {
        return out;
    }

    let gone: Vec<u64> = group_cache
        .keys()
        .filter(|hash| !seen.contains(*hash))
        .copied()
        .collect();
    for hash in gone {
        if let Some(artifacts) = group_cache.remove(&hash) {
            out.extend(Artifact::stale_all(artifacts));
        }
    }
    out
}
