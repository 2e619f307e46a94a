//! Pod role - one target per container port
//!
//! The pod watch keeps three reflector stores in sync: pods themselves plus
//! the ConfigMaps and Secrets the pod spec may reference through `env` and
//! `envFrom`. Translation resolves those references against the stores at
//! the moment the pod key is processed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Container, Pod, Secret};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use scout_core::hash::FieldHasher;
use scout_core::{Group, Tags, Target};

use crate::pipeline::Discoverer;

use super::watcher_config;

/// A single pod container port as a discovery target
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodTarget {
    #[serde(skip)]
    hash: u64,
    #[serde(rename = "TUID")]
    tuid: String,
    #[serde(skip)]
    tags: Tags,

    /// `<podIP>:<port>`
    pub address: String,

    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Pod annotations
    pub annotations: BTreeMap<String, String>,
    /// Pod labels
    pub labels: BTreeMap<String, String>,
    /// Node the pod is scheduled on
    pub node_name: String,
    /// Pod IP address
    #[serde(rename = "PodIP")]
    pub pod_ip: String,

    /// Container name
    pub cont_name: String,
    /// Container image
    pub image: String,
    /// Resolved container environment
    pub env: BTreeMap<String, String>,
    /// Port number as a string
    pub port_number: String,
    /// Port name
    pub port_name: String,
    /// Port protocol (TCP/UDP/SCTP)
    pub port_protocol: String,
}

impl Target for PodTarget {
    fn hash(&self) -> u64 {
        self.hash
    }
    fn tuid(&self) -> &str {
        &self.tuid
    }
    fn tags(&self) -> &Tags {
        &self.tags
    }
    fn tags_mut(&mut self) -> &mut Tags {
        &mut self.tags
    }
    fn view(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl PodTarget {
    fn seal(mut self) -> Self {
        let mut h = FieldHasher::new();
        h.field("address", &self.address);
        h.field("namespace", &self.namespace);
        h.field("name", &self.name);
        h.map_field("annotations", &self.annotations);
        h.map_field("labels", &self.labels);
        h.field("node_name", &self.node_name);
        h.field("pod_ip", &self.pod_ip);
        h.field("cont_name", &self.cont_name);
        h.field("image", &self.image);
        h.map_field("env", &self.env);
        h.field("port_number", &self.port_number);
        h.field("port_name", &self.port_name);
        h.field("port_protocol", &self.port_protocol);
        self.hash = h.finish();
        self
    }
}

/// Resolves ConfigMap and Secret references for env construction
pub(crate) trait EnvLookup {
    fn config_map(&self, namespace: &str, name: &str) -> Option<Arc<ConfigMap>>;
    fn secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>>;
}

struct StoreLookup {
    cmaps: Store<ConfigMap>,
    secrets: Store<Secret>,
}

impl EnvLookup for StoreLookup {
    fn config_map(&self, namespace: &str, name: &str) -> Option<Arc<ConfigMap>> {
        self.cmaps.get(&ObjectRef::new(name).within(namespace))
    }
    fn secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>> {
        self.secrets.get(&ObjectRef::new(name).within(namespace))
    }
}

/// Watches pods in one namespace
pub(crate) struct PodDiscoverer {
    client: Client,
    namespace: String,
    label_selector: String,
    field_selector: String,
}

impl PodDiscoverer {
    pub(crate) fn new(
        client: Client,
        namespace: String,
        label_selector: String,
        field_selector: String,
    ) -> Self {
        Self {
            client,
            namespace,
            label_selector,
            field_selector,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        if self.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        }
    }
}

#[async_trait]
impl Discoverer for PodDiscoverer {
    async fn discover(self: Box<Self>, cancel: CancellationToken, tx: mpsc::Sender<Vec<Group>>) {
        let wc = watcher_config(&self.label_selector, &self.field_selector);

        let (pod_store, pod_writer) = reflector::store::<Pod>();
        let (cmap_store, cmap_writer) = reflector::store::<ConfigMap>();
        let (secret_store, secret_writer) = reflector::store::<Secret>();

        let (key_tx, mut key_rx) = mpsc::unbounded_channel::<(String, String)>();

        let pods: Api<Pod> = self.api();
        let pod_task = tokio::spawn(drive_keyed_watch(
            cancel.clone(),
            reflector(pod_writer, watcher(pods, wc).default_backoff()),
            key_tx,
        ));
        let cmaps: Api<ConfigMap> = self.api();
        let cmap_task = tokio::spawn(drive_watch(
            cancel.clone(),
            reflector(
                cmap_writer,
                watcher(cmaps, watcher::Config::default()).default_backoff(),
            ),
        ));
        let secrets: Api<Secret> = self.api();
        let secret_task = tokio::spawn(drive_watch(
            cancel.clone(),
            reflector(
                secret_writer,
                watcher(secrets, watcher::Config::default()).default_backoff(),
            ),
        ));

        let synced = tokio::select! {
            _ = cancel.cancelled() => false,
            ready = async {
                pod_store.wait_until_ready().await.is_ok()
                    && cmap_store.wait_until_ready().await.is_ok()
                    && secret_store.wait_until_ready().await.is_ok()
            } => ready,
        };

        if synced {
            let lookup = StoreLookup {
                cmaps: cmap_store,
                secrets: secret_store,
            };
            loop {
                let (namespace, name) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = key_rx.recv() => match maybe {
                        Some(key) => key,
                        None => break,
                    },
                };
                let group = match pod_store.get(&ObjectRef::new(&name).within(&namespace)) {
                    None => Group::empty(pod_source(&namespace, &name)),
                    Some(pod) => build_group(&pod, &lookup),
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(vec![group]) => if sent.is_err() { break },
                }
            }
        }

        let _ = tokio::join!(pod_task, cmap_task, secret_task);
    }
}

/// Drive a reflector stream, forwarding object keys into the work queue
pub(crate) async fn drive_keyed_watch<K, S>(
    cancel: CancellationToken,
    stream: S,
    keys: mpsc::UnboundedSender<(String, String)>,
) where
    K: kube::Resource + Send + 'static,
    S: futures::Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
{
    futures::pin_mut!(stream);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = stream.next() => match maybe {
                Some(Ok(event)) => {
                    if let Some(key) = event_key(&event) {
                        let _ = keys.send(key);
                    }
                }
                Some(Err(err)) => warn!(error = %err, "watch error event"),
                None => return,
            },
        }
    }
}

/// Drive a reflector stream purely to keep its store fresh
pub(crate) async fn drive_watch<K, S>(cancel: CancellationToken, stream: S)
where
    K: kube::Resource + Send + 'static,
    S: futures::Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
{
    futures::pin_mut!(stream);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = stream.next() => match maybe {
                Some(Ok(_)) => {}
                Some(Err(err)) => warn!(error = %err, "watch error event"),
                None => return,
            },
        }
    }
}

fn event_key<K: ResourceExt>(event: &watcher::Event<K>) -> Option<(String, String)> {
    let obj = match event {
        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) | watcher::Event::Delete(obj) => {
            obj
        }
        watcher::Event::Init | watcher::Event::InitDone => return None,
    };
    Some((obj.namespace().unwrap_or_default(), obj.name_any()))
}

pub(crate) fn pod_source(namespace: &str, name: &str) -> String {
    format!("k8s/pod/{namespace}/{name}")
}

/// Translate a pod into its group snapshot
///
/// A pod with no IP yet (or no containers) maps to an empty group: the
/// source exists but has nothing discoverable, which withdraws anything
/// previously built for it.
pub(crate) fn build_group(pod: &Pod, lookup: &dyn EnvLookup) -> Group {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let source = pod_source(&namespace, &name);

    let pod_ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .unwrap_or_default();
    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();

    if pod_ip.is_empty() || containers.is_empty() {
        return Group::empty(source);
    }
    Group::new(source, build_targets(pod, &pod_ip, containers, lookup))
}

fn build_targets(
    pod: &Pod,
    pod_ip: &str,
    containers: &[Container],
    lookup: &dyn EnvLookup,
) -> Vec<Box<dyn Target>> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let annotations = pod.metadata.annotations.clone().unwrap_or_default();
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    let node_name = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .unwrap_or_default();

    let mut targets: Vec<Box<dyn Target>> = Vec::new();
    for container in containers {
        let env = collect_env(&namespace, container, lookup);

        for port in container.ports.iter().flatten() {
            let port_number = port.container_port.to_string();
            let protocol = port.protocol.clone().unwrap_or_else(|| "TCP".to_string());
            let target = PodTarget {
                hash: 0,
                tuid: format!(
                    "{namespace}_{name}_{}_{}_{port_number}",
                    container.name,
                    protocol.to_lowercase()
                ),
                tags: Tags::new(),
                address: join_host_port(pod_ip, &port_number),
                namespace: namespace.clone(),
                name: name.clone(),
                annotations: annotations.clone(),
                labels: labels.clone(),
                node_name: node_name.clone(),
                pod_ip: pod_ip.to_string(),
                cont_name: container.name.clone(),
                image: container.image.clone().unwrap_or_default(),
                env: env.clone(),
                port_number,
                port_name: port.name.clone().unwrap_or_default(),
                port_protocol: protocol,
            }
            .seal();
            targets.push(Box::new(target));
        }
    }
    targets
}

/// Build the container's effective environment
///
/// `envFrom` sources first, then `env` entries; when a key appears in
/// several places the later source wins. Names containing `$` are variable
/// references this discoverer does not expand, so they are skipped.
pub(crate) fn collect_env(
    namespace: &str,
    container: &Container,
    lookup: &dyn EnvLookup,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();

    for source in container.env_from.iter().flatten() {
        let prefix = source.prefix.clone().unwrap_or_default();
        if let Some(cmap_ref) = &source.config_map_ref {
            if let Some(cmap) = non_empty(cmap_ref.name.as_deref())
                .and_then(|name| lookup.config_map(namespace, name))
            {
                for (k, v) in cmap.data.iter().flatten() {
                    vars.insert(format!("{prefix}{k}"), v.clone());
                }
            }
        }
        if let Some(secret_ref) = &source.secret_ref {
            if let Some(secret) = non_empty(secret_ref.name.as_deref())
                .and_then(|name| lookup.secret(namespace, name))
            {
                for (k, v) in secret.data.iter().flatten() {
                    vars.insert(
                        format!("{prefix}{k}"),
                        String::from_utf8_lossy(&v.0).to_string(),
                    );
                }
            }
        }
    }

    for env in container.env.iter().flatten() {
        if env.name.is_empty() || env.name.contains('$') {
            continue;
        }
        if let Some(value) = non_empty(env.value.as_deref()) {
            vars.insert(env.name.clone(), value.to_string());
            continue;
        }
        let Some(value_from) = &env.value_from else {
            continue;
        };
        if let Some(cmap_ref) = &value_from.config_map_key_ref {
            if cmap_ref.key.is_empty() {
                continue;
            }
            if let Some(value) = non_empty(cmap_ref.name.as_deref())
                .and_then(|name| lookup.config_map(namespace, name))
                .and_then(|cmap| cmap.data.as_ref()?.get(&cmap_ref.key).cloned())
            {
                vars.insert(env.name.clone(), value);
            }
        }
        if let Some(secret_ref) = &value_from.secret_key_ref {
            if secret_ref.key.is_empty() {
                continue;
            }
            if let Some(value) = non_empty(secret_ref.name.as_deref())
                .and_then(|name| lookup.secret(namespace, name))
                .and_then(|secret| secret.data.as_ref()?.get(&secret_ref.key).cloned())
            {
                vars.insert(env.name.clone(), String::from_utf8_lossy(&value.0).to_string());
            }
        }
    }

    vars
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

/// Join a host and port, bracketing IPv6 hosts
fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
