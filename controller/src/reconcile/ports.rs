use crate::{
    external_workload::{ExternalWorkload, DEFAULT_PROTOCOL},
    service,
};
use k8s_openapi::{
    api::{
        core::v1::{Service, ServicePort},
        discovery::v1::EndpointPort,
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::ResourceExt;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("no suitable port for targetPort {target} ({protocol}) on workload {namespace}/{name}")]
pub struct PortError {
    pub target: String,
    pub protocol: String,
    pub namespace: String,
    pub name: String,
}

/// A canonical, order-insensitive key for a list of endpoint ports. Slices are partitioned by this
/// key; all endpoints in a slice share its ports.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortMapKey(Vec<PortKey>);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct PortKey {
    name: Option<String>,
    port: Option<i32>,
    protocol: Option<String>,
    app_protocol: Option<String>,
}

// === impl PortMapKey ===

impl PortMapKey {
    pub fn new(ports: &[EndpointPort]) -> Self {
        let mut keys = ports
            .iter()
            .map(|p| PortKey {
                name: p.name.clone(),
                port: p.port,
                protocol: p.protocol.clone(),
                app_protocol: p.app_protocol.clone(),
            })
            .collect::<Vec<_>>();
        keys.sort();
        Self(keys)
    }
}

/// Computes the endpoint ports a workload exposes for a service.
///
/// Every service port must be resolvable against a port the workload documents, with the same
/// protocol: named target ports match by name and numeric target ports match by number. Unlike
/// pods, numeric ports the workload doesn't declare are never assumed to exist.
pub fn resolve(svc: &Service, workload: &ExternalWorkload) -> Result<Vec<EndpointPort>, PortError> {
    let svc_ports = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or_default();

    // Headless services may omit ports altogether.
    if svc_ports.is_empty() && service::is_headless(svc) {
        return Ok(Vec::new());
    }

    svc_ports
        .iter()
        .map(|sp| -> Result<EndpointPort, PortError> {
            let port = find_workload_port(workload, sp)?;
            Ok(EndpointPort {
                name: sp.name.clone().filter(|n| !n.is_empty()),
                port: Some(port),
                protocol: Some(protocol(sp).to_string()),
                app_protocol: sp.app_protocol.clone(),
            })
        })
        .collect()
}

fn protocol(sp: &ServicePort) -> &str {
    sp.protocol
        .as_deref()
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_PROTOCOL)
}

fn find_workload_port(workload: &ExternalWorkload, sp: &ServicePort) -> Result<i32, PortError> {
    let proto = protocol(sp);
    // An unset target port defaults to the service port.
    let target = sp
        .target_port
        .clone()
        .unwrap_or(IntOrString::Int(sp.port));

    let found = match &target {
        IntOrString::String(name) => workload
            .ports()
            .iter()
            .find(|p| p.name.as_deref() == Some(name.as_str()) && p.protocol() == proto),
        IntOrString::Int(number) => workload
            .ports()
            .iter()
            .find(|p| i32::from(p.port.get()) == *number && p.protocol() == proto),
    };

    found.map(|p| i32::from(p.port.get())).ok_or_else(|| PortError {
        target: match target {
            IntOrString::Int(n) => n.to_string(),
            IntOrString::String(s) => s,
        },
        protocol: proto.to_string(),
        namespace: workload.namespace().unwrap_or_default(),
        name: workload.name_any(),
    })
}
