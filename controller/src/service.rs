use crate::external_workload::ExternalWorkload;
use k8s_openapi::api::core::v1::Service;
use kube::{
    runtime::reflector::{ObjectRef, Store},
    ResourceExt,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt,
    net::IpAddr,
};

pub const CLUSTER_IP_NONE: &str = "None";

/// Identifies a Service by its namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

/// The address family of an EndpointSlice.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

// === impl ServiceRef ===

impl ServiceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_service(svc: &Service) -> Self {
        Self::new(
            svc.namespace().expect("services must be namespaced"),
            svc.name_any(),
        )
    }

    pub fn object_ref(&self) -> ObjectRef<Service> {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl AddressFamily ===

impl AddressFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ipv4 => "IPv4",
            Self::Ipv6 => "IPv6",
        }
    }

    /// Parses an EndpointSlice `addressType` or a Service `ipFamilies` entry. Other address
    /// types (e.g. `FQDN`) are not managed by this controller.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "IPv4" => Some(Self::Ipv4),
            "IPv6" => Some(Self::Ipv6),
            _ => None,
        }
    }

    /// Determines the family of an address literal. Anything that doesn't parse as IPv6 is
    /// treated as IPv4.
    pub fn of_addr(addr: &str) -> Self {
        match addr.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => Self::Ipv6,
            Ok(IpAddr::V4(_)) => Self::Ipv4,
            Err(_) if addr.contains(':') => Self::Ipv6,
            Err(_) => Self::Ipv4,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_headless(svc: &Service) -> bool {
    svc.spec.as_ref().and_then(|s| s.cluster_ip.as_deref()) == Some(CLUSTER_IP_NONE)
}

pub fn selector(svc: &Service) -> Option<&BTreeMap<String, String>> {
    svc.spec.as_ref()?.selector.as_ref()
}

/// Tests whether every key/value pair in the selector is present in `labels`. An empty selector
/// matches everything.
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Returns the address families for which EndpointSlices may exist for the service.
///
/// Services that predate dual-stack support have no `ipFamilies`: headless services support both
/// families and other services support the family of their cluster IP.
pub fn supported_families(svc: &Service) -> BTreeSet<AddressFamily> {
    let spec = match svc.spec.as_ref() {
        Some(spec) => spec,
        None => return BTreeSet::new(),
    };

    let families = spec
        .ip_families
        .iter()
        .flatten()
        .filter_map(|f| AddressFamily::from_name(f))
        .collect::<BTreeSet<_>>();
    if !families.is_empty() {
        return families;
    }

    match spec.cluster_ip.as_deref() {
        Some(CLUSTER_IP_NONE) => [AddressFamily::Ipv4, AddressFamily::Ipv6].into_iter().collect(),
        Some(ip) if !ip.is_empty() => std::iter::once(AddressFamily::of_addr(ip)).collect(),
        _ => BTreeSet::new(),
    }
}

/// Returns the keys of all services in the workload's namespace that select it.
pub fn resolve(services: &Store<Service>, workload: &ExternalWorkload) -> HashSet<ServiceRef> {
    let namespace = workload.namespace();
    services
        .state()
        .into_iter()
        .filter(|svc| svc.namespace() == namespace)
        .filter(|svc| match selector(svc) {
            Some(sel) => selector_matches(sel, workload.labels()),
            None => false,
        })
        .map(|svc| ServiceRef::from_service(&svc))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::external_workload::tests::mk_workload;
    use k8s_openapi::{
        api::core::v1::{ServicePort, ServiceSpec},
        apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
    };
    use kube::runtime::{reflector::store::Writer, watcher};

    pub(crate) fn mk_service(ns: &str, name: &str, selector: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                uid: Some(format!("{}-{}-uid", ns, name)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(
                    selector
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                cluster_ip: Some("10.43.0.10".to_string()),
                ip_families: Some(vec!["IPv4".to_string()]),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: 80,
                    protocol: Some("TCP".to_string()),
                    target_port: Some(IntOrString::Int(8080)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn mk_store(svcs: Vec<Service>) -> Store<Service> {
        let mut writer = Writer::<Service>::default();
        writer.apply_watcher_event(&watcher::Event::Restarted(svcs));
        writer.as_reader()
    }

    #[test]
    fn resolves_selecting_services_in_namespace() {
        let mut unselected = mk_service("ns-0", "nil", &[]);
        unselected.spec.as_mut().unwrap().selector = None;
        let services = mk_store(vec![
            mk_service("ns-0", "web", &[("app", "web")]),
            mk_service("ns-0", "web-v1", &[("app", "web"), ("version", "v1")]),
            mk_service("ns-0", "web-v2", &[("app", "web"), ("version", "v2")]),
            mk_service("ns-1", "web", &[("app", "web")]),
            unselected,
        ]);

        let wl = mk_workload(
            "ns-0",
            "wl-0",
            &[("app", "web"), ("version", "v1")],
            &["192.0.2.1"],
            &[(None, 8080)],
            true,
        );
        let expected = vec![
            ServiceRef::new("ns-0", "web"),
            ServiceRef::new("ns-0", "web-v1"),
        ]
        .into_iter()
        .collect::<HashSet<_>>();
        assert_eq!(resolve(&services, &wl), expected);
    }

    #[test]
    fn families_from_spec() {
        let svc = mk_service("ns-0", "web", &[]);
        assert_eq!(
            supported_families(&svc),
            std::iter::once(AddressFamily::Ipv4).collect()
        );

        let mut dual = svc.clone();
        dual.spec.as_mut().unwrap().ip_families =
            Some(vec!["IPv6".to_string(), "IPv4".to_string()]);
        assert_eq!(supported_families(&dual).len(), 2);
    }

    #[test]
    fn families_without_ip_families() {
        let mut headless = mk_service("ns-0", "web", &[]);
        {
            let spec = headless.spec.as_mut().unwrap();
            spec.ip_families = None;
            spec.cluster_ip = Some(CLUSTER_IP_NONE.to_string());
        }
        assert!(is_headless(&headless));
        assert_eq!(
            supported_families(&headless),
            [AddressFamily::Ipv4, AddressFamily::Ipv6]
                .into_iter()
                .collect()
        );

        let mut v6 = headless.clone();
        v6.spec.as_mut().unwrap().cluster_ip = Some("fd00::10".to_string());
        assert!(!is_headless(&v6));
        assert_eq!(
            supported_families(&v6),
            std::iter::once(AddressFamily::Ipv6).collect()
        );
    }

    #[test]
    fn address_family_of_literals() {
        assert_eq!(AddressFamily::of_addr("192.0.2.1"), AddressFamily::Ipv4);
        assert_eq!(AddressFamily::of_addr("2001:db8::1"), AddressFamily::Ipv6);
        assert_eq!(AddressFamily::from_name("FQDN"), None);
    }
}
