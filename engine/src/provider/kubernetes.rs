//! Kubernetes ConfigMap provider
//!
//! Watches a single (namespace, name, key) triple. Every relevant change
//! produces exactly one event; deletion of the object or absence of the
//! key produces a removal so the supervisor tears the pipeline down.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Client};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{ConfigEvent, PipelineConfig};
use crate::discovery::kubernetes::pod::drive_keyed_watch;
use crate::error::{EngineError, Result};
use crate::provider::ConfigProvider;

/// Watches one ConfigMap key for pipeline configuration
pub struct CmapProvider {
    namespace: String,
    name: String,
    key: String,
    client: Client,
}

impl CmapProvider {
    /// Validate the triple and build the cluster client
    pub async fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let key = key.into();
        if name.is_empty() {
            return Err(EngineError::Config("config map not set".to_string()));
        }
        if key.is_empty() {
            return Err(EngineError::Config("config map key not set".to_string()));
        }
        let client = Client::try_default().await?;
        Ok(Self {
            namespace: namespace.into(),
            name,
            key,
            client,
        })
    }
}

#[async_trait]
impl ConfigProvider for CmapProvider {
    async fn run(self: Box<Self>, cancel: CancellationToken, tx: mpsc::Sender<Vec<ConfigEvent>>) {
        info!(
            source = %source(&self.namespace, &self.name, &self.key),
            "k8s config provider started"
        );

        let api: Api<ConfigMap> = if self.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        };

        let (store, writer) = reflector::store::<ConfigMap>();
        let (key_tx, mut key_rx) = mpsc::unbounded_channel::<(String, String)>();
        let watch_task = tokio::spawn(drive_keyed_watch(
            cancel.clone(),
            reflector(
                writer,
                watcher(api, watcher::Config::default()).default_backoff(),
            ),
            key_tx,
        ));

        let synced = tokio::select! {
            _ = cancel.cancelled() => false,
            ready = store.wait_until_ready() => ready.is_ok(),
        };
        if !synced && !cancel.is_cancelled() {
            error!("unable to sync caches");
        }

        if synced {
            loop {
                let (namespace, name) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = key_rx.recv() => match maybe {
                        Some(key) => key,
                        None => break,
                    },
                };
                if name != self.name {
                    continue;
                }
                if !self.namespace.is_empty() && namespace != self.namespace {
                    continue;
                }

                let cmap = store.get(&ObjectRef::new(&name).within(&namespace));
                let Some(event) = decode_event(
                    source(&namespace, &name, &self.key),
                    cmap.as_deref(),
                    &self.key,
                ) else {
                    continue;
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(vec![event]) => if sent.is_err() { break },
                }
            }
        }

        let _ = watch_task.await;
        info!("k8s config provider stopped");
    }
}

fn source(namespace: &str, name: &str, key: &str) -> String {
    format!("k8s/cmap/{namespace}/{name}:{key}")
}

/// Translate the current object state into a config event
///
/// Returns `None` when the key's value fails to decode; the event is
/// dropped and the previously running pipeline is left alone.
fn decode_event(source: String, cmap: Option<&ConfigMap>, key: &str) -> Option<ConfigEvent> {
    let Some(cmap) = cmap else {
        return Some(ConfigEvent::removed(source));
    };
    let Some(data) = cmap.data.as_ref().and_then(|d| d.get(key)) else {
        debug!(%source, "config map has no such key");
        return Some(ConfigEvent::removed(source));
    };
    if data.trim().is_empty() {
        return Some(ConfigEvent::removed(source));
    }
    match serde_yaml::from_str::<PipelineConfig>(data) {
        Ok(pipeline) => Some(ConfigEvent::updated(source, pipeline)),
        Err(err) => {
            error!(%source, error = %err, "failed to decode config map key");
            None
        }
    }
}
