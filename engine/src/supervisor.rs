//! Supervisor - reconciles live pipelines against configuration events
//!
//! The supervisor keeps exactly one running pipeline per known source. A
//! changed document (by structural hash) restarts its pipeline; an
//! unchanged one is a no-op; a removed one tears the pipeline down. Stops
//! are synchronous: the old pipeline's whole task tree has returned before
//! the replacement starts, so two pipelines for one source never overlap.
//!
//! A factory failure cancels the change: the previous pipeline, if any,
//! keeps running and the cached hash is not updated, so a later good
//! revision of the document is seen as a change. The hash recorded on
//! success is always the new document's hash.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::build::BuildManager;
use crate::config::{ConfigEvent, PipelineConfig};
use crate::discovery::DiscoveryManager;
use crate::error::Result;
use crate::export::ExportManager;
use crate::pipeline::Pipeline;
use crate::provider::ConfigProvider;
use crate::tag::TagManager;

/// Builds a pipeline from a configuration document
#[async_trait]
pub trait PipelineFactory: Send + Sync + 'static {
    /// Construct all four stages; any error aborts the change
    async fn build(&self, cfg: &PipelineConfig) -> Result<Pipeline>;
}

/// The stock factory wiring k8s discovery, tag, build, and export
pub struct DefaultFactory {
    stdout_enabled: bool,
}

impl DefaultFactory {
    /// `stdout_enabled` is the process-wide terminal flag, computed once
    /// at startup
    pub fn new(stdout_enabled: bool) -> Self {
        Self { stdout_enabled }
    }
}

#[async_trait]
impl PipelineFactory for DefaultFactory {
    async fn build(&self, cfg: &PipelineConfig) -> Result<Pipeline> {
        cfg.validate()?;
        let discoverer = DiscoveryManager::new(&cfg.discovery).await?;
        let tagger = TagManager::new(&cfg.tag)?;
        let builder = BuildManager::new(&cfg.build)?;
        let exporter = ExportManager::new(&cfg.export, self.stdout_enabled)?;
        Ok(Pipeline::new(
            Box::new(discoverer),
            Box::new(tagger),
            Box::new(builder),
            Box::new(exporter),
        ))
    }
}

struct StopHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl StopHandle {
    /// Cancel the pipeline and wait for its whole task tree to return
    async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

/// Owns the set of live pipelines
pub struct Supervisor {
    provider: Box<dyn ConfigProvider>,
    factory: Box<dyn PipelineFactory>,
    cache: HashMap<String, u64>,
    live: HashMap<String, StopHandle>,
}

impl Supervisor {
    /// Create a supervisor over a provider and a pipeline factory
    pub fn new(provider: Box<dyn ConfigProvider>, factory: Box<dyn PipelineFactory>) -> Self {
        Self {
            provider,
            factory,
            cache: HashMap::new(),
            live: HashMap::new(),
        }
    }

    /// Run until cancelled; returns after every live pipeline has stopped
    pub async fn run(self, cancel: CancellationToken) {
        let Supervisor {
            provider,
            factory,
            mut cache,
            mut live,
        } = self;

        info!("supervisor started");
        let (events_tx, mut events_rx) = mpsc::channel(1);
        let provider_task = tokio::spawn(provider.run(cancel.clone(), events_tx));

        'outer: loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = events_rx.recv() => match maybe {
                    Some(batch) => batch,
                    None => break,
                },
            };
            for event in batch {
                if cancel.is_cancelled() {
                    break 'outer;
                }
                process_event(&cancel, factory.as_ref(), &mut cache, &mut live, event).await;
            }
        }

        for (source, handle) in live.drain() {
            info!(%source, "stopping pipeline");
            handle.stop().await;
        }
        let _ = provider_task.await;
        info!("supervisor stopped");
    }
}

async fn process_event(
    cancel: &CancellationToken,
    factory: &dyn PipelineFactory,
    cache: &mut HashMap<String, u64>,
    live: &mut HashMap<String, StopHandle>,
    event: ConfigEvent,
) {
    if event.source.is_empty() {
        return;
    }

    let Some(cfg) = event.pipeline else {
        cache.remove(&event.source);
        if let Some(handle) = live.remove(&event.source) {
            info!(source = %event.source, "stopping pipeline");
            handle.stop().await;
        }
        return;
    };

    let hash = cfg.hash();
    if cache.get(&event.source) == Some(&hash) {
        return;
    }

    let pipeline = match factory.build(&cfg).await {
        Ok(pipeline) => pipeline,
        Err(err) => {
            warn!(source = %event.source, error = %err, "failed to build pipeline, keeping the previous one");
            return;
        }
    };

    cache.insert(event.source.clone(), hash);
    if let Some(handle) = live.remove(&event.source) {
        info!(source = %event.source, "stopping pipeline");
        handle.stop().await;
    }

    info!(source = %event.source, name = %cfg.name, "starting pipeline");
    let token = cancel.child_token();
    let task = tokio::spawn(pipeline.run(token.clone()));
    live.insert(event.source, StopHandle { token, task });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use scout_core::{Artifact, Group};

    use crate::pipeline::{Builder, Discoverer, Exporter, Tagger};

    // ========================================================================
    // Doubles
    // ========================================================================

    struct IdleDiscoverer;

    #[async_trait]
    impl Discoverer for IdleDiscoverer {
        async fn discover(
            self: Box<Self>,
            cancel: CancellationToken,
            _tx: mpsc::Sender<Vec<Group>>,
        ) {
            cancel.cancelled().await;
        }
    }

    struct IdleTagger;
    impl Tagger for IdleTagger {
        fn tag(&self, _target: &mut dyn scout_core::Target) {}
    }

    struct IdleBuilder;
    impl Builder for IdleBuilder {
        fn build(&self, _target: &dyn scout_core::Target) -> Vec<Artifact> {
            Vec::new()
        }
    }

    /// Exporter that reports its lifecycle so tests can observe overlap
    struct LifecycleExporter {
        id: usize,
        events: mpsc::UnboundedSender<(usize, &'static str)>,
    }

    #[async_trait]
    impl Exporter for LifecycleExporter {
        async fn export(
            self: Box<Self>,
            cancel: CancellationToken,
            _rx: mpsc::Receiver<Vec<Artifact>>,
        ) {
            let _ = self.events.send((self.id, "started"));
            cancel.cancelled().await;
            let _ = self.events.send((self.id, "stopped"));
        }
    }

    /// Factory that counts builds and fails on documents named "bad"
    struct TestFactory {
        builds: AtomicUsize,
        events: mpsc::UnboundedSender<(usize, &'static str)>,
    }

    #[async_trait]
    impl PipelineFactory for TestFactory {
        async fn build(&self, cfg: &PipelineConfig) -> Result<Pipeline> {
            let id = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
            if cfg.name == "bad" {
                return Err(crate::error::EngineError::Config(
                    "'tag' not set, need at least 1 rule".to_string(),
                ));
            }
            Ok(Pipeline::new(
                Box::new(IdleDiscoverer),
                Box::new(IdleTagger),
                Box::new(IdleBuilder),
                Box::new(LifecycleExporter {
                    id,
                    events: self.events.clone(),
                }),
            ))
        }
    }

    struct ChannelProvider {
        feed: mpsc::UnboundedReceiver<Vec<ConfigEvent>>,
    }

    #[async_trait]
    impl ConfigProvider for ChannelProvider {
        async fn run(
            self: Box<Self>,
            cancel: CancellationToken,
            tx: mpsc::Sender<Vec<ConfigEvent>>,
        ) {
            let mut feed = self.feed;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    maybe = feed.recv() => match maybe {
                        Some(batch) => {
                            if tx.send(batch).await.is_err() {
                                return;
                            }
                        }
                        None => { cancel.cancelled().await; return; }
                    },
                }
            }
        }
    }

    fn named(name: &str) -> PipelineConfig {
        PipelineConfig {
            name: name.to_string(),
            ..Default::default()
        }
    }

    struct Harness {
        feed: mpsc::UnboundedSender<Vec<ConfigEvent>>,
        lifecycle: mpsc::UnboundedReceiver<(usize, &'static str)>,
        builds: Arc<TestFactory>,
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    }

    fn harness() -> Harness {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let factory = Arc::new(TestFactory {
            builds: AtomicUsize::new(0),
            events: events_tx,
        });

        struct SharedFactory(Arc<TestFactory>);
        #[async_trait]
        impl PipelineFactory for SharedFactory {
            async fn build(&self, cfg: &PipelineConfig) -> Result<Pipeline> {
                self.0.build(cfg).await
            }
        }

        let supervisor = Supervisor::new(
            Box::new(ChannelProvider { feed: feed_rx }),
            Box::new(SharedFactory(Arc::clone(&factory))),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));
        Harness {
            feed: feed_tx,
            lifecycle: events_rx,
            builds: factory,
            cancel,
            handle,
        }
    }

    // ========================================================================
    // Scenarios
    // ========================================================================

    #[tokio::test]
    async fn add_noop_restart_remove() {
        let mut h = harness();

        // add
        h.feed
            .send(vec![ConfigEvent::updated("s", named("p1"))])
            .unwrap();
        assert_eq!(h.lifecycle.recv().await.unwrap(), (1, "started"));

        // identical document: no restart
        h.feed
            .send(vec![ConfigEvent::updated("s", named("p1"))])
            .unwrap();

        // changed document: old stops fully before the new one starts
        h.feed
            .send(vec![ConfigEvent::updated("s", named("p2"))])
            .unwrap();
        assert_eq!(h.lifecycle.recv().await.unwrap(), (1, "stopped"));
        assert_eq!(h.lifecycle.recv().await.unwrap(), (2, "started"));

        // removal
        h.feed.send(vec![ConfigEvent::removed("s")]).unwrap();
        assert_eq!(h.lifecycle.recv().await.unwrap(), (2, "stopped"));

        // the no-op event never reached the factory
        assert_eq!(h.builds.builds.load(Ordering::SeqCst), 2);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn factory_error_keeps_previous_pipeline() {
        let mut h = harness();

        h.feed
            .send(vec![ConfigEvent::updated("s", named("p1"))])
            .unwrap();
        assert_eq!(h.lifecycle.recv().await.unwrap(), (1, "started"));

        // bad revision: factory errors, pipeline 1 keeps running
        h.feed
            .send(vec![ConfigEvent::updated("s", named("bad"))])
            .unwrap();

        // the cache was not updated either: re-sending the good document
        // is still a no-op against the cached hash
        h.feed
            .send(vec![ConfigEvent::updated("s", named("p1"))])
            .unwrap();

        // teardown proves pipeline 1 was alive the whole time
        h.feed.send(vec![ConfigEvent::removed("s")]).unwrap();
        assert_eq!(h.lifecycle.recv().await.unwrap(), (1, "stopped"));
        assert_eq!(h.builds.builds.load(Ordering::SeqCst), 2);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn events_with_empty_source_are_ignored() {
        let mut h = harness();

        h.feed
            .send(vec![ConfigEvent::updated("", named("p1"))])
            .unwrap();
        h.feed
            .send(vec![ConfigEvent::updated("s", named("p1"))])
            .unwrap();
        assert_eq!(h.lifecycle.recv().await.unwrap(), (1, "started"));
        assert_eq!(h.builds.builds.load(Ordering::SeqCst), 1);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn removal_of_unknown_source_is_a_noop() {
        let mut h = harness();
        h.feed.send(vec![ConfigEvent::removed("ghost")]).unwrap();
        h.feed
            .send(vec![ConfigEvent::updated("s", named("p1"))])
            .unwrap();
        assert_eq!(h.lifecycle.recv().await.unwrap(), (1, "started"));

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_every_live_pipeline() {
        let mut h = harness();

        h.feed
            .send(vec![
                ConfigEvent::updated("s1", named("p1")),
                ConfigEvent::updated("s2", named("p2")),
            ])
            .unwrap();
        assert_eq!(h.lifecycle.recv().await.unwrap().1, "started");
        assert_eq!(h.lifecycle.recv().await.unwrap().1, "started");

        h.cancel.cancel();
        h.handle.await.unwrap();

        let mut stopped = 0;
        while let Ok((_, what)) = h.lifecycle.try_recv() {
            if what == "stopped" {
                stopped += 1;
            }
        }
        assert_eq!(stopped, 2);
    }

    #[tokio::test]
    async fn two_sources_run_independently() {
        let mut h = harness();

        h.feed
            .send(vec![ConfigEvent::updated("s1", named("p1"))])
            .unwrap();
        h.feed
            .send(vec![ConfigEvent::updated("s2", named("p2"))])
            .unwrap();
        assert_eq!(h.lifecycle.recv().await.unwrap().1, "started");
        assert_eq!(h.lifecycle.recv().await.unwrap().1, "started");

        // removing one source leaves the other alone
        h.feed.send(vec![ConfigEvent::removed("s1")]).unwrap();
        assert_eq!(h.lifecycle.recv().await.unwrap(), (1, "stopped"));

        h.feed.send(vec![ConfigEvent::removed("s2")]).unwrap();
        assert_eq!(h.lifecycle.recv().await.unwrap(), (2, "stopped"));

        h.cancel.cancel();
        h.handle.await.unwrap();
    }
}
