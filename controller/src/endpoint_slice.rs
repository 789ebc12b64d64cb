use crate::service::{AddressFamily, ServiceRef};
use k8s_openapi::{
    api::{core::v1::Service, discovery::v1::EndpointSlice},
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::ResourceExt;

pub const LABEL_SERVICE_NAME: &str = "kubernetes.io/service-name";
pub const LABEL_MANAGED_BY: &str = "endpointslice.kubernetes.io/managed-by";
pub const LABEL_HEADLESS: &str = "service.kubernetes.io/headless";

pub fn address_family(slice: &EndpointSlice) -> Option<AddressFamily> {
    AddressFamily::from_name(&slice.address_type)
}

/// Indicates whether the slice carries an owner reference to this exact Service instance. Slices
/// left behind by a prior Service with the same name don't match its UID.
pub fn is_owned_by(slice: &EndpointSlice, svc: &Service) -> bool {
    let uid = match svc.metadata.uid.as_deref() {
        Some(uid) => uid,
        None => return false,
    };
    slice
        .owner_references()
        .iter()
        .any(|o| o.uid == uid && o.kind == "Service" && o.api_version == "v1")
}

pub fn is_managed_by(slice: &EndpointSlice, controller: &str) -> bool {
    slice.labels().get(LABEL_MANAGED_BY).map(String::as_str) == Some(controller)
}

/// Returns the key of the Service a slice belongs to, from its service-name label.
pub fn service_ref(slice: &EndpointSlice) -> Option<ServiceRef> {
    let name = slice.labels().get(LABEL_SERVICE_NAME)?;
    let ns = slice.namespace()?;
    Some(ServiceRef::new(ns, name.clone()))
}

pub fn owner_reference(svc: &Service) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "Service".to_string(),
        name: svc.name_any(),
        uid: svc.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Returns the `generateName` prefix for a service's slices.
pub fn name_prefix(service: &str) -> String {
    // Generated names get a 5 character suffix and must remain valid DNS subdomains.
    const MAX_PREFIX_LEN: usize = 253 - 5;
    let prefix = format!("linkerd-external-{}-", service);
    if prefix.len() <= MAX_PREFIX_LEN {
        return prefix;
    }
    let mut prefix = service.to_string();
    prefix.truncate(MAX_PREFIX_LEN - 1);
    prefix.push('-');
    prefix
}
