//! Converges a service's EndpointSlices with the ExternalWorkloads it selects.
//!
//! A reconciliation is computed in two phases. [`Reconciler::plan`] is a pure function from a
//! snapshot of the service, its workloads, and its existing slices to a [`Plan`] of creates,
//! updates, and deletes. [`Reconciler::apply`] then issues those writes through a
//! [`SliceWriter`].
//!
//! Slices are partitioned by address family and then by port list: every endpoint in a slice
//! shares the slice's ports. Within a partition, endpoints that are already present in a slice
//! stay there, new endpoints are packed into the fullest slices with spare capacity, and new
//! slices are created only when no existing slice can take them.

pub mod endpoint;
pub mod labels;
pub mod ports;
mod store;

pub use self::store::{KubeSliceWriter, SliceWriter, WriteError};
use self::{endpoint::EndpointSet, ports::PortMapKey};
use crate::{
    endpoint_slice,
    external_workload::ExternalWorkload,
    service::{self, AddressFamily},
};
use k8s_openapi::{
    api::{
        core::v1::Service,
        discovery::v1::{EndpointPort, EndpointSlice},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::ResourceExt;
use std::{
    borrow::Borrow,
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
};

pub const DEFAULT_MAX_ENDPOINTS_PER_SLICE: usize = 100;
pub const DEFAULT_CONTROLLER_NAME: &str = "linkerd-external-workloads-controller";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// The maximum number of endpoints in a single slice.
    pub max_endpoints_per_slice: usize,

    /// Identifies this controller in the managed-by label of the slices it owns.
    pub controller_name: String,
}

/// The writes needed to converge a service's slices.
#[derive(Clone, Debug, Default)]
pub struct Plan {
    pub create: Vec<EndpointSlice>,
    pub update: Vec<EndpointSlice>,
    pub delete: Vec<EndpointSlice>,
}

#[derive(Clone, Debug)]
pub struct Reconciler {
    config: Config,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            max_endpoints_per_slice: DEFAULT_MAX_ENDPOINTS_PER_SLICE,
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
        }
    }
}

// === impl Plan ===

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(mut config: Config) -> Self {
        // A slice must be able to hold at least one endpoint.
        config.max_endpoints_per_slice = config.max_endpoints_per_slice.max(1);
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Converges the service's slices with its workloads.
    ///
    /// Returns the first write error. A retried reconciliation recomputes everything from a new
    /// snapshot, so no partial state is kept.
    #[tracing::instrument(skip_all, fields(
        namespace = %svc.namespace().unwrap_or_default(),
        service = %svc.name_any(),
    ))]
    pub async fn reconcile<W, S, T>(
        &self,
        svc: &Service,
        workloads: &[W],
        slices: &[S],
        store: &T,
    ) -> Result<(), WriteError>
    where
        W: Borrow<ExternalWorkload>,
        S: Borrow<EndpointSlice>,
        T: SliceWriter + ?Sized,
    {
        let plan = self.plan(svc, workloads, slices);
        if plan.is_empty() {
            tracing::debug!("no update necessary");
            return Ok(());
        }
        tracing::debug!(
            create = plan.create.len(),
            update = plan.update.len(),
            delete = plan.delete.len(),
            "reconciling EndpointSlices"
        );
        self.apply(svc, plan, store).await
    }

    /// Computes the writes needed to converge `slices` with the endpoints for `workloads`.
    ///
    /// None of the inputs are modified; slices in the plan are copies.
    pub fn plan<W, S>(&self, svc: &Service, workloads: &[W], slices: &[S]) -> Plan
    where
        W: Borrow<ExternalWorkload>,
        S: Borrow<EndpointSlice>,
    {
        let mut plan = Plan::default();
        let families = service::supported_families(svc);

        let mut by_family = BTreeMap::<AddressFamily, Vec<&EndpointSlice>>::new();
        for slice in slices.iter().map(as_slice) {
            match endpoint_slice::address_family(slice) {
                Some(family) if families.contains(&family) => {
                    by_family.entry(family).or_default().push(slice)
                }
                _ => {
                    tracing::debug!(
                        slice = %slice.name_any(),
                        address_type = %slice.address_type,
                        "deleting EndpointSlice with unsupported address type"
                    );
                    plan.delete.push(slice.clone());
                }
            }
        }

        // Ports don't depend on the address family, so they're resolved once per workload.
        let workloads = workloads
            .iter()
            .map(as_workload)
            .filter(|wl| wl.is_usable())
            .filter_map(|wl| match ports::resolve(svc, wl) {
                Ok(ports) => Some((wl, ports)),
                Err(error) => {
                    tracing::info!(%error, "skipping workload");
                    None
                }
            })
            .collect::<Vec<_>>();

        for family in families {
            let existing = by_family.remove(&family).unwrap_or_default();
            self.plan_family(svc, family, &workloads, existing, &mut plan);
        }

        recycle(svc, &mut plan);
        plan
    }

    fn plan_family(
        &self,
        svc: &Service,
        family: AddressFamily,
        workloads: &[(&ExternalWorkload, Vec<EndpointPort>)],
        existing: Vec<&EndpointSlice>,
        plan: &mut Plan,
    ) {
        let mut existing_by_ports = HashMap::<PortMapKey, Vec<&EndpointSlice>>::new();
        for slice in existing {
            if endpoint_slice::is_owned_by(slice, svc) {
                let key = PortMapKey::new(slice.ports.as_deref().unwrap_or_default());
                existing_by_ports.entry(key).or_default().push(slice);
            } else {
                tracing::debug!(
                    slice = %slice.name_any(),
                    "deleting EndpointSlice not owned by service"
                );
                plan.delete.push(slice.clone());
            }
        }

        let mut desired = HashMap::<PortMapKey, (&[EndpointPort], EndpointSet)>::new();
        for (wl, ports) in workloads {
            let ep = endpoint::project(family, wl, svc);
            // Endpoints without an address in this family must not take up room in a slice.
            if ep.addresses.is_empty() {
                continue;
            }
            desired
                .entry(PortMapKey::new(ports))
                .or_insert_with(|| (ports.as_slice(), EndpointSet::default()))
                .1
                .insert(ep);
        }

        // Slices for port lists that no workload uses anymore.
        for (key, slices) in existing_by_ports.iter() {
            if !desired.contains_key(key) {
                plan.delete.extend(slices.iter().map(|s| (*s).clone()));
            }
        }

        for (key, (ports, endpoints)) in desired {
            let existing = existing_by_ports.remove(&key).unwrap_or_default();
            self.plan_ports(svc, family, ports, existing, endpoints, plan);
        }
    }

    fn plan_ports(
        &self,
        svc: &Service,
        family: AddressFamily,
        ports: &[EndpointPort],
        existing: Vec<&EndpointSlice>,
        mut desired: EndpointSet,
        plan: &mut Plan,
    ) {
        let max = self.config.max_endpoints_per_slice;
        let mut updates = Vec::<EndpointSlice>::new();
        let mut unchanged = Vec::<&EndpointSlice>::new();

        // Keep endpoints where they are, dropping the ones that are no longer desired.
        for slice in existing {
            let mut covered = Vec::with_capacity(slice.endpoints.len());
            let mut changed = false;
            for ep in &slice.endpoints {
                if let Some(want) = desired.remove(ep) {
                    changed |= !endpoint::equal_beyond_key(&want, ep);
                    covered.push(want);
                }
            }
            if covered.len() > max {
                for ep in covered.drain(max..) {
                    desired.insert(ep);
                }
            }

            let (labels, labels_changed) =
                labels::sync(slice, svc, &self.config.controller_name);
            if changed || covered.len() != slice.endpoints.len() {
                if covered.is_empty() {
                    plan.delete.push(slice.clone());
                } else {
                    let mut slice = slice.clone();
                    slice.metadata.labels = Some(labels);
                    slice.endpoints = covered;
                    updates.push(slice);
                }
            } else if labels_changed {
                let mut slice = slice.clone();
                slice.metadata.labels = Some(labels);
                updates.push(slice);
            } else {
                unchanged.push(slice);
            }
        }

        // Place new endpoints in slices that are already being written, fullest first.
        updates.sort_by_key(|s| Reverse(s.endpoints.len()));
        for slice in updates.iter_mut() {
            fill(slice, &mut desired, max);
        }

        // Then in slices that would otherwise be left alone, fullest first.
        unchanged.sort_by_key(|s| Reverse(s.endpoints.len()));
        for slice in unchanged {
            if !desired.is_empty() && slice.endpoints.len() < max {
                let mut slice = slice.clone();
                fill(&mut slice, &mut desired, max);
                updates.push(slice);
            } else if slice.endpoints.is_empty() {
                plan.delete.push(slice.clone());
            }
        }

        while !desired.is_empty() {
            let mut slice = self.new_slice(svc, family, ports);
            fill(&mut slice, &mut desired, max);
            plan.create.push(slice);
        }

        for slice in updates {
            if slice.endpoints.is_empty() {
                plan.delete.push(slice);
            } else {
                plan.update.push(slice);
            }
        }
    }

    fn new_slice(
        &self,
        svc: &Service,
        family: AddressFamily,
        ports: &[EndpointPort],
    ) -> EndpointSlice {
        let mut slice = EndpointSlice {
            metadata: ObjectMeta {
                generate_name: Some(endpoint_slice::name_prefix(&svc.name_any())),
                namespace: svc.namespace(),
                owner_references: Some(vec![endpoint_slice::owner_reference(svc)]),
                ..Default::default()
            },
            address_type: family.as_str().to_string(),
            endpoints: Vec::new(),
            ports: Some(ports.to_vec()),
        };
        let (labels, _) = labels::sync(&slice, svc, &self.config.controller_name);
        slice.metadata.labels = Some(labels);
        slice
    }

    /// Issues the plan's writes: creates, then updates, then deletes. Stops at the first failure.
    pub async fn apply<T>(&self, svc: &Service, plan: Plan, store: &T) -> Result<(), WriteError>
    where
        T: SliceWriter + ?Sized,
    {
        let namespace = svc.namespace().expect("services must be namespaced");
        let Plan {
            create,
            update,
            delete,
        } = plan;

        // Slices created for a service that's being deleted would be orphaned.
        if svc.metadata.deletion_timestamp.is_none() {
            for slice in create {
                match store.create(&namespace, slice).await {
                    Ok(_) => {}
                    Err(WriteError::NamespaceTerminating(_)) => {
                        tracing::debug!("namespace is terminating; skipping remaining writes");
                        return Ok(());
                    }
                    Err(error) => return Err(error),
                }
            }
        } else if !create.is_empty() {
            tracing::debug!(
                skipped = create.len(),
                "service is being deleted; not creating EndpointSlices"
            );
        }

        for slice in update {
            store.update(&namespace, slice).await?;
        }

        for slice in delete {
            store.delete(&namespace, &slice).await?;
        }

        Ok(())
    }
}

fn as_workload<W: Borrow<ExternalWorkload>>(wl: &W) -> &ExternalWorkload {
    wl.borrow()
}

fn as_slice<S: Borrow<EndpointSlice>>(slice: &S) -> &EndpointSlice {
    slice.borrow()
}

fn fill(slice: &mut EndpointSlice, desired: &mut EndpointSet, max: usize) {
    while slice.endpoints.len() < max {
        match desired.pop() {
            Some(ep) => slice.endpoints.push(ep),
            None => return,
        }
    }
}

/// Turns pairs of deletes and creates into updates of the slice that would be deleted, so that
/// existing object names are reused rather than churned.
///
/// Only slices owned by this service instance are reused, and only for the same address family:
/// the address type of a slice is immutable.
fn recycle(svc: &Service, plan: &mut Plan) {
    let mut deletes = Vec::with_capacity(plan.delete.len());
    for prior in std::mem::take(&mut plan.delete) {
        let idx = if endpoint_slice::is_owned_by(&prior, svc) {
            plan.create
                .iter()
                .rposition(|s| s.address_type == prior.address_type)
        } else {
            None
        };
        match idx {
            Some(idx) => {
                let mut slice = plan.create.remove(idx);
                slice.metadata = ObjectMeta {
                    labels: slice.metadata.labels,
                    owner_references: slice.metadata.owner_references,
                    managed_fields: None,
                    ..prior.metadata
                };
                plan.update.push(slice);
            }
            None => deletes.push(prior),
        }
    }
    plan.delete = deletes;
}
