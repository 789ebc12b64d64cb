use crate::service::{self, ServiceRef};
use k8s_openapi::{api::core::v1::Service, apimachinery::pkg::apis::meta::v1::Time};
use kube::{runtime::reflector::Store, ResourceExt};
use std::{
    collections::{HashMap, HashSet},
    num::NonZeroU16,
};

/// ExternalWorkload describes a single workload (i.e. a deployable unit, conceptually similar to a
/// Kubernetes Pod) that is running outside of a Kubernetes cluster. An ExternalWorkload should be
/// enrolled in the mesh and typically represents a virtual machine.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    kube::CustomResource,
    serde::Deserialize,
    serde::Serialize,
    schemars::JsonSchema,
)]
#[kube(
    group = "workload.linkerd.io",
    version = "v1beta1",
    kind = "ExternalWorkload",
    status = "ExternalWorkloadStatus",
    namespaced
)]
pub struct ExternalWorkloadSpec {
    /// TLS settings used by peers to authenticate the workload
    #[serde(rename = "meshTLS")]
    pub mesh_tls: MeshTls,

    /// Ports exposed by the workload
    pub ports: Option<Vec<PortSpec>>,

    /// IP addresses that can be used to send traffic to the workload
    #[serde(rename = "workloadIPs")]
    pub workload_ips: Option<Vec<WorkloadIp>>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeshTls {
    pub identity: String,
    pub server_name: String,
}

/// A network port exposed by a workload.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
pub struct PortSpec {
    /// Referenced by a Service's named `targetPort`.
    pub name: Option<String>,
    pub port: NonZeroU16,
    /// One of TCP, UDP, or SCTP. Defaults to TCP.
    pub protocol: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
pub struct WorkloadIp {
    pub ip: String,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct ExternalWorkloadStatus {
    pub conditions: Vec<Condition>,
}

/// The service state of an ExternalWorkload.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub typ: String,
    pub status: ConditionStatus,
    pub last_transition_time: Option<Time>,
    pub last_probe_time: Option<Time>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

pub const DEFAULT_PROTOCOL: &str = "TCP";

// === impl ExternalWorkload ===

impl ExternalWorkload {
    /// Indicates whether the workload reports a `Ready` condition with a `True` status.
    pub fn is_ready(&self) -> bool {
        self.status
            .iter()
            .flat_map(|s| s.conditions.iter())
            .find(|c| c.typ == "Ready")
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    pub fn ips(&self) -> &[WorkloadIp] {
        self.spec.workload_ips.as_deref().unwrap_or_default()
    }

    pub fn ports(&self) -> &[PortSpec] {
        self.spec.ports.as_deref().unwrap_or_default()
    }

    /// Workloads without addresses or ports can't be projected into endpoints.
    pub fn is_usable(&self) -> bool {
        !self.ips().is_empty() && !self.ports().is_empty()
    }
}

// === impl PortSpec ===

impl PortSpec {
    pub fn protocol(&self) -> &str {
        self.protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL)
    }
}

/// Determines whether a change to a workload affects the content of the endpoints built from it:
/// its readiness, its deletion state, its addresses, or its ports.
pub fn content_changed(old: &ExternalWorkload, new: &ExternalWorkload) -> bool {
    if old.metadata.deletion_timestamp != new.metadata.deletion_timestamp {
        return true;
    }

    if old.is_ready() != new.is_ready() {
        return true;
    }

    let old_ips = old.ips().iter().map(|ip| &ip.ip).collect::<HashSet<_>>();
    let new_ips = new.ips().iter().map(|ip| &ip.ip).collect::<HashSet<_>>();
    if old.ips().len() != new.ips().len() || old_ips != new_ips {
        return true;
    }

    if old.ports().len() != new.ports().len() {
        return true;
    }
    let old_ports = old
        .ports()
        .iter()
        .map(|p| (p.port, p))
        .collect::<HashMap<_, _>>();
    new.ports().iter().any(|port| match old_ports.get(&port.port) {
        Some(prior) => prior.name != port.name || prior.protocol() != port.protocol(),
        None => true,
    })
}

pub fn labels_changed(old: &ExternalWorkload, new: &ExternalWorkload) -> bool {
    old.labels() != new.labels()
}

/// Computes the services that need to be reconciled after a workload changes from `old` to `new`.
///
/// When only the labels changed, the endpoint itself is unchanged, so only services that match
/// exactly one of the two label sets need to be processed. When the endpoint content changed as
/// well, every service matching either version must be refreshed.
pub fn services_to_update(
    services: &Store<Service>,
    old: &ExternalWorkload,
    new: &ExternalWorkload,
) -> HashSet<ServiceRef> {
    if old.resource_version().is_some() && old.resource_version() == new.resource_version() {
        // Resyncs redeliver objects that haven't changed.
        return HashSet::new();
    }

    let content = content_changed(old, new);
    let labels = labels_changed(old, new);
    if !content && !labels {
        return HashSet::new();
    }

    let current = service::resolve(services, new);
    if !labels {
        return current;
    }

    let prior = service::resolve(services, old);
    if content {
        current.union(&prior).cloned().collect()
    } else {
        current.symmetric_difference(&prior).cloned().collect()
    }
}
