use crate::{
    endpoint_slice::{LABEL_HEADLESS, LABEL_MANAGED_BY, LABEL_SERVICE_NAME},
    service,
};
use k8s_openapi::api::{core::v1::Service, discovery::v1::EndpointSlice};
use kube::ResourceExt;
use std::collections::BTreeMap;

type Labels = BTreeMap<String, String>;

fn is_reserved(key: &str) -> bool {
    key == LABEL_SERVICE_NAME || key == LABEL_MANAGED_BY || key == LABEL_HEADLESS
}

/// Computes the labels a slice should carry: the service's labels, minus the reserved keys, plus
/// the reserved keys as set by this controller. Also indicates whether these differ from the
/// slice's current labels.
pub fn sync(slice: &EndpointSlice, svc: &Service, controller: &str) -> (Labels, bool) {
    let mut labels = svc
        .labels()
        .iter()
        .filter(|(k, _)| !is_reserved(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<Labels>();

    if service::is_headless(svc) {
        labels.insert(LABEL_HEADLESS.to_string(), String::new());
    }
    labels.insert(LABEL_SERVICE_NAME.to_string(), svc.name_any());
    labels.insert(LABEL_MANAGED_BY.to_string(), controller.to_string());

    let changed = *slice.labels() != labels;
    (labels, changed)
}
