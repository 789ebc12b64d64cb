#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Linkerd External Endpoints Controller
//!
//! Projects `ExternalWorkload` resources into `EndpointSlice`s so that service discovery consumers
//! see workloads running outside of the cluster as if they were ordinary pods. The controller
//! watches Services, ExternalWorkloads, and the EndpointSlices it manages; every change is fanned
//! out into a set of service keys which are reconciled one at a time.

pub mod endpoint_slice;
pub mod external_workload;
pub mod index;
pub mod queue;
pub mod reconcile;
pub mod service;
pub mod tracker;

pub use self::{
    external_workload::ExternalWorkload,
    index::Index,
    queue::{Queue, Worker},
    reconcile::{Config, Reconciler},
    service::ServiceRef,
    tracker::SliceTracker,
};
pub use k8s_openapi::api::{core::v1::Service, discovery::v1::EndpointSlice};

use kube::runtime::watcher;

/// A watch event for any of the resource kinds the controller indexes.
///
/// Deletions carry the last known state of the object, so they double as tombstones.
#[derive(Clone, Debug)]
pub enum Update {
    Workload(watcher::Event<ExternalWorkload>),
    Service(watcher::Event<Service>),
    Slice(watcher::Event<EndpointSlice>),
}

// === impl Update ===

impl From<watcher::Event<ExternalWorkload>> for Update {
    fn from(ev: watcher::Event<ExternalWorkload>) -> Self {
        Self::Workload(ev)
    }
}

impl From<watcher::Event<Service>> for Update {
    fn from(ev: watcher::Event<Service>) -> Self {
        Self::Service(ev)
    }
}

impl From<watcher::Event<EndpointSlice>> for Update {
    fn from(ev: watcher::Event<EndpointSlice>) -> Self {
        Self::Slice(ev)
    }
}
