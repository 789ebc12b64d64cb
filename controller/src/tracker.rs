use crate::{endpoint_slice, service::ServiceRef};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::{borrow::Borrow, collections::HashMap, sync::Arc};

pub type SharedTracker = Arc<Mutex<SliceTracker>>;

/// Tracks the generation of each EndpointSlice this controller has written, per service.
///
/// The watch cache lags behind writes. The tracker lets the controller tell its own writes apart
/// from changes made by others, and detect when the cache hasn't yet observed a prior write.
#[derive(Debug, Default)]
pub struct SliceTracker {
    by_service: HashMap<ServiceRef, HashMap<String, Generation>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Generation {
    Written(i64),
    DeletionExpected,
}

fn generation(slice: &EndpointSlice) -> i64 {
    slice.metadata.generation.unwrap_or_default()
}

// === impl SliceTracker ===

impl SliceTracker {
    pub fn shared() -> SharedTracker {
        Arc::new(Mutex::new(Self::default()))
    }

    fn get(&self, slice: &EndpointSlice) -> Option<Generation> {
        let svc = endpoint_slice::service_ref(slice)?;
        let uid = slice.uid()?;
        self.by_service.get(&svc)?.get(&uid).copied()
    }

    fn set(&mut self, slice: &EndpointSlice, written: Generation) {
        if let (Some(svc), Some(uid)) = (endpoint_slice::service_ref(slice), slice.uid()) {
            self.by_service.entry(svc).or_default().insert(uid, written);
        }
    }

    pub fn has(&self, slice: &EndpointSlice) -> bool {
        self.get(slice).is_some()
    }

    /// Indicates whether a slice event should trigger a reconciliation: the slice is unknown or
    /// it has changed since this controller last wrote it.
    pub fn should_sync(&self, slice: &EndpointSlice) -> bool {
        match self.get(slice) {
            Some(Generation::Written(written)) => generation(slice) > written,
            Some(Generation::DeletionExpected) | None => true,
        }
    }

    /// Records the generation returned by a successful write.
    pub fn update(&mut self, slice: &EndpointSlice) {
        self.set(slice, Generation::Written(generation(slice)));
    }

    pub fn expect_deletion(&mut self, slice: &EndpointSlice) {
        self.set(slice, Generation::DeletionExpected);
    }

    /// Undoes [`SliceTracker::expect_deletion`] when the delete didn't go through. The slice is
    /// still present at the generation that was observed.
    pub fn cancel_deletion(&mut self, slice: &EndpointSlice) {
        if self.get(slice) == Some(Generation::DeletionExpected) {
            self.update(slice);
        }
    }

    /// Forgets a deleted slice. Returns false if this controller deleted it.
    pub fn handle_deletion(&mut self, slice: &EndpointSlice) -> bool {
        let (svc, uid) = match (endpoint_slice::service_ref(slice), slice.uid()) {
            (Some(svc), Some(uid)) => (svc, uid),
            _ => return true,
        };
        let gens = match self.by_service.get_mut(&svc) {
            Some(gens) => gens,
            None => return true,
        };
        let prior = gens.remove(&uid);
        if gens.is_empty() {
            self.by_service.remove(&svc);
        }
        prior != Some(Generation::DeletionExpected)
    }

    /// Indicates whether `slices` is older than what this controller has written for the
    /// service: a slice has an older generation or should have been deleted, or a written slice is
    /// missing altogether.
    pub fn stale_slices<S: Borrow<EndpointSlice>>(&self, svc: &ServiceRef, slices: &[S]) -> bool {
        let gens = match self.by_service.get(svc) {
            Some(gens) => gens,
            None => return false,
        };

        let mut provided = HashMap::with_capacity(slices.len());
        for slice in slices {
            let slice: &EndpointSlice = slice.borrow();
            let uid = match slice.uid() {
                Some(uid) => uid,
                None => continue,
            };
            match gens.get(&uid) {
                Some(Generation::DeletionExpected) => return true,
                Some(Generation::Written(written)) if *written > generation(slice) => return true,
                _ => {}
            }
            provided.insert(uid, generation(slice));
        }

        gens.iter().any(|(uid, written)| {
            matches!(written, Generation::Written(_)) && !provided.contains_key(uid)
        })
    }

    pub fn delete_service(&mut self, svc: &ServiceRef) {
        self.by_service.remove(svc);
    }
}
