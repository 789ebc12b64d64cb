//! Maps watch events onto the services that must be reconciled.

use crate::{
    endpoint_slice,
    external_workload::{self, ExternalWorkload},
    queue::Queue,
    service::{self, ServiceRef},
    tracker::SharedTracker,
    Update,
};
use futures::prelude::*;
use k8s_openapi::api::{core::v1::Service, discovery::v1::EndpointSlice};
use kube::runtime::{
    reflector::{ObjectRef, Store},
    watcher::Event,
};
use std::collections::{HashMap, HashSet};

/// Remembers the last observed version of every workload so that updates can be classified, and
/// schedules the services affected by each event.
pub struct Index {
    services: Store<Service>,
    workloads: HashMap<ObjectRef<ExternalWorkload>, ExternalWorkload>,
    tracker: SharedTracker,
    controller_name: String,
    queue: Queue,
}

// === impl Index ===

impl Index {
    pub fn new(
        services: Store<Service>,
        tracker: SharedTracker,
        controller_name: impl Into<String>,
        queue: Queue,
    ) -> Self {
        Self {
            services,
            workloads: HashMap::new(),
            tracker,
            controller_name: controller_name.into(),
            queue,
        }
    }

    /// Handles updates until the stream ends.
    ///
    /// The service cache must already reflect each update when it is received.
    pub async fn run<S>(mut self, updates: S)
    where
        S: Stream<Item = Update>,
    {
        tokio::pin!(updates);
        while let Some(update) = updates.next().await {
            self.handle(update);
        }
    }

    pub fn handle(&mut self, update: Update) {
        match update {
            Update::Workload(ev) => self.handle_workload(ev),
            Update::Service(ev) => self.handle_service(ev),
            Update::Slice(ev) => self.handle_slice(ev),
        }
    }

    fn handle_workload(&mut self, ev: Event<ExternalWorkload>) {
        match ev {
            Event::Applied(wl) => self.apply_workload(wl),

            Event::Deleted(wl) => {
                self.workloads.remove(&ObjectRef::from_obj(&wl));
                let services = service::resolve(&self.services, &wl);
                self.enqueue(services);
            }

            Event::Restarted(wls) => {
                let mut vanished = std::mem::take(&mut self.workloads);
                for wl in wls {
                    if let Some(prior) = vanished.remove(&ObjectRef::from_obj(&wl)) {
                        self.workloads.insert(ObjectRef::from_obj(&prior), prior);
                    }
                    self.apply_workload(wl);
                }
                for wl in vanished.into_values() {
                    let services = service::resolve(&self.services, &wl);
                    self.enqueue(services);
                }
            }
        }
    }

    fn apply_workload(&mut self, wl: ExternalWorkload) {
        let key = ObjectRef::from_obj(&wl);
        let services = match self.workloads.get(&key) {
            Some(prior) => external_workload::services_to_update(&self.services, prior, &wl),
            None => service::resolve(&self.services, &wl),
        };
        tracing::trace!(workload = %key, services = services.len(), "workload updated");
        self.workloads.insert(key, wl);
        self.enqueue(services);
    }

    fn handle_service(&mut self, ev: Event<Service>) {
        match ev {
            Event::Applied(svc) => self.queue.enqueue(ServiceRef::from_service(&svc)),

            Event::Deleted(svc) => {
                let key = ServiceRef::from_service(&svc);
                self.tracker.lock().delete_service(&key);
                self.queue.enqueue(key);
            }

            Event::Restarted(svcs) => {
                for svc in svcs {
                    self.queue.enqueue(ServiceRef::from_service(&svc));
                }
            }
        }
    }

    fn handle_slice(&mut self, ev: Event<EndpointSlice>) {
        match ev {
            Event::Applied(slice) => self.apply_slice(&slice),

            Event::Deleted(slice) => {
                if !endpoint_slice::is_managed_by(&slice, &self.controller_name) {
                    return;
                }
                let mut tracker = self.tracker.lock();
                if !tracker.has(&slice) {
                    return;
                }
                if !tracker.handle_deletion(&slice) {
                    tracing::trace!(slice = ?slice.metadata.name, "deletion expected");
                    return;
                }
                drop(tracker);
                if let Some(key) = endpoint_slice::service_ref(&slice) {
                    self.queue.enqueue(key);
                }
            }

            Event::Restarted(slices) => {
                for slice in &slices {
                    self.apply_slice(slice);
                }
            }
        }
    }

    fn apply_slice(&self, slice: &EndpointSlice) {
        if !endpoint_slice::is_managed_by(slice, &self.controller_name) {
            return;
        }
        let key = match endpoint_slice::service_ref(slice) {
            Some(key) => key,
            None => return,
        };
        if self.tracker.lock().should_sync(slice) {
            self.queue.enqueue(key);
        }
    }

    fn enqueue(&self, services: HashSet<ServiceRef>) {
        for key in services {
            self.queue.enqueue(key);
        }
    }
}
