//! Service role - one target per service port

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use scout_core::hash::FieldHasher;
use scout_core::{Group, Tags, Target};

use crate::pipeline::Discoverer;

use super::pod::drive_keyed_watch;
use super::watcher_config;

/// A single service port as a discovery target
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceTarget {
    #[serde(skip)]
    hash: u64,
    #[serde(rename = "TUID")]
    tuid: String,
    #[serde(skip)]
    tags: Tags,

    /// `<name>.<namespace>.svc:<port>`
    pub address: String,

    /// Service namespace
    pub namespace: String,
    /// Service name
    pub name: String,
    /// Service annotations
    pub annotations: BTreeMap<String, String>,
    /// Service labels
    pub labels: BTreeMap<String, String>,
    /// Port number as a string
    pub port_number: String,
    /// Port name
    pub port_name: String,
    /// Port protocol (TCP/UDP/SCTP)
    pub port_protocol: String,
    /// Cluster IP address
    #[serde(rename = "ClusterIP")]
    pub cluster_ip: String,
    /// External name for ExternalName services
    pub external_name: String,
    /// Service type
    #[serde(rename = "Type")]
    pub type_: String,
}

impl Target for ServiceTarget {
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

impl ServiceTarget {
    fn seal(mut self) -> Self {
        let mut h = FieldHasher::new();
        h.field("address", &self.address);
        h.field("namespace", &self.namespace);
        h.field("name", &self.name);
        h.map_field("annotations", &self.annotations);
        h.map_field("labels", &self.labels);
        h.field("port_number", &self.port_number);
        h.field("port_name", &self.port_name);
        h.field("port_protocol", &self.port_protocol);
        h.field("cluster_ip", &self.cluster_ip);
        h.field("external_name", &self.external_name);
        h.field("type", &self.type_);
        self.hash = h.finish();
        self
    }
}

/// Watches services in one namespace
pub(crate) struct ServiceDiscoverer {
    client: Client,
    namespace: String,
    label_selector: String,
    field_selector: String,
}

impl ServiceDiscoverer {
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
}

#[async_trait]
impl Discoverer for ServiceDiscoverer {
    async fn discover(self: Box<Self>, cancel: CancellationToken, tx: mpsc::Sender<Vec<Group>>) {
        let services: Api<Service> = if self.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        };
        let wc = watcher_config(&self.label_selector, &self.field_selector);

        let (store, writer) = reflector::store::<Service>();
        let (key_tx, mut key_rx) = mpsc::unbounded_channel::<(String, String)>();

        let watch_task = tokio::spawn(drive_keyed_watch(
            cancel.clone(),
            reflector(writer, watcher(services, wc).default_backoff()),
            key_tx,
        ));
        let synced = tokio::select! {
            _ = cancel.cancelled() => false,
            ready = store.wait_until_ready() => ready.is_ok(),
        };

        if synced {
            loop {
                let (namespace, name) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = key_rx.recv() => match maybe {
                        Some(key) => key,
                        None => break,
                    },
                };
                let group = match store.get(&ObjectRef::new(&name).within(&namespace)) {
                    None => Group::empty(service_source(&namespace, &name)),
                    Some(service) => build_group(&service),
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(vec![group]) => if sent.is_err() { break },
                }
            }
        }

        let _ = watch_task.await;
    }
}

pub(crate) fn service_source(namespace: &str, name: &str) -> String {
    format!("k8s/service/{namespace}/{name}")
}

/// Translate a service into its group snapshot
///
/// Headless and port-less services carry nothing discoverable, so they map
/// to an empty group for their source.
pub(crate) fn build_group(service: &Service) -> Group {
    let namespace = service.namespace().unwrap_or_default();
    let name = service.name_any();
    let source = service_source(&namespace, &name);

    let Some(spec) = service.spec.as_ref() else {
        return Group::empty(source);
    };
    let cluster_ip = spec.cluster_ip.clone().unwrap_or_default();
    let ports = spec.ports.as_deref().unwrap_or_default();
    if cluster_ip.is_empty() || ports.is_empty() {
        return Group::empty(source);
    }

    let annotations = service.metadata.annotations.clone().unwrap_or_default();
    let labels = service.metadata.labels.clone().unwrap_or_default();
    let external_name = spec.external_name.clone().unwrap_or_default();
    let type_ = spec.type_.clone().unwrap_or_default();

    let mut targets: Vec<Box<dyn Target>> = Vec::with_capacity(ports.len());
    for port in ports {
        let port_number = port.port.to_string();
        let protocol = port.protocol.clone().unwrap_or_else(|| "TCP".to_string());
        let target = ServiceTarget {
            hash: 0,
            tuid: format!(
                "{namespace}_{name}_{}_{port_number}",
                protocol.to_lowercase()
            ),
            tags: Tags::new(),
            address: format!("{name}.{namespace}.svc:{port_number}"),
            namespace: namespace.clone(),
            name: name.clone(),
            annotations: annotations.clone(),
            labels: labels.clone(),
            port_number,
            port_name: port.name.clone().unwrap_or_default(),
            port_protocol: protocol,
            cluster_ip: cluster_ip.clone(),
            external_name: external_name.clone(),
            type_: type_.clone(),
        }
        .seal();
        targets.push(Box::new(target));
    }
    Group::new(source, targets)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn service(cluster_ip: &str, ports: Vec<(i32, &str)>) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("web".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: if cluster_ip.is_empty() {
                    None
                } else {
                    Some(cluster_ip.to_string())
                },
                type_: Some("ClusterIP".to_string()),
                ports: Some(
                    ports
                        .into_iter()
                        .map(|(number, name)| ServicePort {
                            port: number,
                            name: Some(name.to_string()),
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn builds_one_target_per_port() {
        let group = build_group(&service("10.96.0.10", vec![(80, "http"), (443, "https")]));
        assert_eq!(group.source, "k8s/service/default/web");
        assert_eq!(group.targets.len(), 2);
        assert_eq!(group.targets[0].tuid(), "default_web_tcp_80");
    }

    #[test]
    fn address_uses_cluster_dns_form() {
        let group = build_group(&service("10.96.0.10", vec![(80, "http")]));
        let view = group.targets[0].view();
        assert_eq!(view["Address"], "web.default.svc:80");
        assert_eq!(view["ClusterIP"], "10.96.0.10");
        assert_eq!(view["Type"], "ClusterIP");
    }

    #[test]
    fn ipv6_cluster_ip_does_not_change_the_address_form() {
        // the address host is a DNS name, so no bracketing applies
        let group = build_group(&service("2001:db8::10", vec![(80, "http")]));
        let view = group.targets[0].view();
        assert_eq!(view["Address"], "web.default.svc:80");
        assert_eq!(view["ClusterIP"], "2001:db8::10");
    }

    #[test]
    fn headless_service_maps_to_empty_group() {
        let group = build_group(&service("", vec![(80, "http")]));
        assert_eq!(group.source, "k8s/service/default/web");
        assert!(group.targets.is_empty());
    }

    #[test]
    fn portless_service_maps_to_empty_group() {
        assert!(build_group(&service("10.96.0.10", vec![])).targets.is_empty());
    }

    #[test]
    fn identity_is_stable_and_content_sensitive() {
        let a = build_group(&service("10.96.0.10", vec![(80, "http")]));
        let b = build_group(&service("10.96.0.10", vec![(80, "http")]));
        assert_eq!(a.targets[0].hash(), b.targets[0].hash());

        let c = build_group(&service("10.96.0.11", vec![(80, "http")]));
        assert_ne!(a.targets[0].hash(), c.targets[0].hash());
    }
}
