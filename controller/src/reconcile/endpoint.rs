use crate::{
    external_workload::ExternalWorkload,
    service::{self, AddressFamily},
};
use k8s_openapi::api::{
    core::v1::{ObjectReference, Service},
    discovery::v1::{Endpoint, EndpointConditions},
};
use kube::ResourceExt;
use std::collections::HashMap;

pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";

/// A set of endpoints, keyed by the object each endpoint targets.
///
/// Endpoints without a target reference are keyed by their addresses. No ordering is maintained.
#[derive(Clone, Debug, Default)]
pub struct EndpointSet(HashMap<EndpointKey, Endpoint>);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum EndpointKey {
    Target {
        namespace: Option<String>,
        name: Option<String>,
    },
    Addresses(Vec<String>),
}

/// Builds the endpoint for a workload in the given address family.
///
/// The endpoint's address list is empty when the workload has no address in `family`; callers
/// must not place such endpoints in a slice.
pub fn project(family: AddressFamily, workload: &ExternalWorkload, svc: &Service) -> Endpoint {
    let addresses = workload
        .ips()
        .iter()
        .filter(|ip| AddressFamily::of_addr(&ip.ip) == family)
        .map(|ip| ip.ip.clone())
        .collect();

    let ready = workload.is_ready();
    let hostname = if service::is_headless(svc) && workload.namespace() == svc.namespace() {
        Some(workload.name_any())
    } else {
        None
    };

    Endpoint {
        addresses,
        conditions: Some(EndpointConditions {
            ready: Some(ready),
            serving: Some(ready),
            // External workloads have no terminating phase.
            terminating: Some(false),
        }),
        target_ref: Some(ObjectReference {
            kind: Some("ExternalWorkload".to_string()),
            namespace: workload.namespace(),
            name: Some(workload.name_any()),
            uid: workload.uid(),
            ..Default::default()
        }),
        zone: workload.labels().get(LABEL_TOPOLOGY_ZONE).cloned(),
        hostname,
        ..Default::default()
    }
}

/// Compares the fields of two endpoints that aren't covered by their set key.
pub fn equal_beyond_key(a: &Endpoint, b: &Endpoint) -> bool {
    let mut a_addrs = a.addresses.iter().collect::<Vec<_>>();
    let mut b_addrs = b.addresses.iter().collect::<Vec<_>>();
    a_addrs.sort();
    b_addrs.sort();

    a_addrs == b_addrs
        && a.hostname == b.hostname
        && a.zone == b.zone
        && a.node_name == b.node_name
        && a.conditions == b.conditions
        && a.target_ref.as_ref().map(|r| &r.uid) == b.target_ref.as_ref().map(|r| &r.uid)
}

// === impl EndpointKey ===

impl EndpointKey {
    fn of(ep: &Endpoint) -> Self {
        match &ep.target_ref {
            Some(r) => Self::Target {
                namespace: r.namespace.clone(),
                name: r.name.clone(),
            },
            None => {
                let mut addrs = ep.addresses.clone();
                addrs.sort();
                Self::Addresses(addrs)
            }
        }
    }
}

// === impl EndpointSet ===

impl EndpointSet {
    /// Inserts an endpoint, returning any endpoint it replaced.
    pub fn insert(&mut self, ep: Endpoint) -> Option<Endpoint> {
        self.0.insert(EndpointKey::of(&ep), ep)
    }

    /// Returns the endpoint in the set with the same key as `ep`.
    pub fn get(&self, ep: &Endpoint) -> Option<&Endpoint> {
        self.0.get(&EndpointKey::of(ep))
    }

    pub fn remove(&mut self, ep: &Endpoint) -> Option<Endpoint> {
        self.0.remove(&EndpointKey::of(ep))
    }

    /// Removes an arbitrary endpoint from the set.
    pub fn pop(&mut self) -> Option<Endpoint> {
        let key = self.0.keys().next()?.clone();
        self.0.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
