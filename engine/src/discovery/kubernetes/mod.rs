//! Kubernetes discovery - pods and services as target groups
//!
//! One discoverer per (namespace × role). Each discoverer keeps reflector
//! stores in sync with the cluster and translates watch events into group
//! snapshots keyed by a stable source string:
//!
//! ```text
//! k8s/pod/<namespace>/<name>
//! k8s/service/<namespace>/<name>
//! ```
//!
//! An object that disappears from the store produces an empty group for its
//! source, which downstream treats as a removal.

pub mod pod;
pub mod service;

use async_trait::async_trait;
use kube::Client;
use kube::runtime::watcher;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use scout_core::{Group, Tags};

use crate::error::{EngineError, Result};
use crate::pipeline::Discoverer;

pub(crate) const ROLE_POD: &str = "pod";
pub(crate) const ROLE_SERVICE: &str = "service";

const ENV_NODE_NAME: &str = "MY_NODE_NAME";

/// One Kubernetes discoverer entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Static tags merged into every discovered target; mandatory
    #[serde(default)]
    pub tags: String,
    /// Namespaces to watch; empty means all namespaces
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// `pod` or `service`; mandatory
    #[serde(default)]
    pub role: String,
    /// Restrict the pod role to the local node (`MY_NODE_NAME`)
    #[serde(default)]
    pub local_mode: bool,
    /// Label and field selectors forwarded to the watch
    #[serde(default)]
    pub selector: SelectorConfig,
}

/// Label and field selectors for the watch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Kubernetes label selector expression
    #[serde(default)]
    pub label: String,
    /// Kubernetes field selector expression
    #[serde(default)]
    pub field: String,
}

pub(crate) fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.role != ROLE_POD && cfg.role != ROLE_SERVICE {
        return Err(EngineError::Config(format!(
            "invalid role '{}', valid roles: '{ROLE_POD}', '{ROLE_SERVICE}'",
            cfg.role
        )));
    }
    if cfg.tags.is_empty() {
        return Err(EngineError::Config(format!(
            "no tags set for '{}' role",
            cfg.role
        )));
    }
    Ok(())
}

/// Resolve the effective field selector, folding in local mode
///
/// Local mode pins the pod watch to the node named by `MY_NODE_NAME`;
/// a missing variable is a configuration error, not a silent fallback.
pub(crate) fn resolve_field_selector(cfg: &Config, node_name: Option<&str>) -> Result<String> {
    if !(cfg.local_mode && cfg.role == ROLE_POD) {
        return Ok(cfg.selector.field.clone());
    }
    match node_name {
        Some(name) if !name.is_empty() => Ok(join_selectors(
            &cfg.selector.field,
            &format!("spec.nodeName={name}"),
        )),
        _ => Err(EngineError::Config(format!(
            "local_mode is enabled, but env '{ENV_NODE_NAME}' not set"
        ))),
    }
}

fn join_selectors(a: &str, b: &str) -> String {
    if a.is_empty() {
        b.to_string()
    } else {
        format!("{a},{b}")
    }
}

pub(crate) fn watcher_config(label: &str, field: &str) -> watcher::Config {
    let mut wc = watcher::Config::default();
    if !label.is_empty() {
        wc = wc.labels(label);
    }
    if !field.is_empty() {
        wc = wc.fields(field);
    }
    wc
}

/// Kubernetes discovery for one configured entry
pub struct KubeDiscovery {
    tags: Tags,
    namespaces: Vec<String>,
    role: String,
    label_selector: String,
    field_selector: String,
    client: Client,
}

impl KubeDiscovery {
    /// Validate configuration and build the cluster client
    ///
    /// The client picks in-cluster configuration when the service account
    /// environment is present and falls back to the local kubeconfig.
    pub async fn new(cfg: &Config) -> Result<Self> {
        validate_config(cfg).map_err(|e| e.context("k8s discovery config validation"))?;

        let tags = Tags::parse(&cfg.tags)?;
        let node_name = std::env::var(ENV_NODE_NAME).ok();
        let field_selector = resolve_field_selector(cfg, node_name.as_deref())?;
        let client = Client::try_default().await?;

        let namespaces = if cfg.namespaces.is_empty() {
            vec![String::new()]
        } else {
            cfg.namespaces.clone()
        };

        Ok(Self {
            tags,
            namespaces,
            role: cfg.role.clone(),
            label_selector: cfg.selector.label.clone(),
            field_selector,
            client,
        })
    }
}

#[async_trait]
impl Discoverer for KubeDiscovery {
    async fn discover(self: Box<Self>, cancel: CancellationToken, tx: mpsc::Sender<Vec<Group>>) {
        let (updates_tx, updates_rx) = mpsc::channel(1);

        let mut handles = Vec::with_capacity(self.namespaces.len() + 1);
        for namespace in &self.namespaces {
            let task: tokio::task::JoinHandle<()> = match self.role.as_str() {
                ROLE_POD => tokio::spawn(
                    Box::new(pod::PodDiscoverer::new(
                        self.client.clone(),
                        namespace.clone(),
                        self.label_selector.clone(),
                        self.field_selector.clone(),
                    ))
                    .discover(cancel.clone(), updates_tx.clone()),
                ),
                _ => tokio::spawn(
                    Box::new(service::ServiceDiscoverer::new(
                        self.client.clone(),
                        namespace.clone(),
                        self.label_selector.clone(),
                        self.field_selector.clone(),
                    ))
                    .discover(cancel.clone(), updates_tx.clone()),
                ),
            };
            handles.push(task);
        }
        drop(updates_tx);

        info!(role = %self.role, discoverers = handles.len(), "k8s discovery started");
        handles.push(tokio::spawn(run_enrich(
            cancel, updates_rx, tx, self.tags,
        )));

        for handle in handles {
            let _ = handle.await;
        }
        info!("k8s discovery stopped");
    }
}

/// Merge the configured static tag set into every target, then forward
async fn run_enrich(
    cancel: CancellationToken,
    mut updates_rx: mpsc::Receiver<Vec<Group>>,
    tx: mpsc::Sender<Vec<Group>>,
    tags: Tags,
) {
    loop {
        let mut groups = tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = updates_rx.recv() => match maybe {
                Some(groups) => groups,
                None => return,
            },
        };
        enrich(&mut groups, &tags);
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = tx.send(groups) => if sent.is_err() { return },
        }
    }
}

pub(crate) fn enrich(groups: &mut [Group], tags: &Tags) {
    for group in groups {
        for target in &mut group.targets {
            target.tags_mut().merge(tags);
        }
    }
}
