use crate::ExportSettings;
use gantry_model::{kebab, GroupTag, InstanceGroup};
use serde_json::json;
use serde_yaml::Value;

/// Services for one instance group, derived from its jobs' declared ports:
/// a ClusterIP service for all ports, a `-public` LoadBalancer service for
/// public ones, and a headless `-set` service for active-passive groups.
pub fn new_service_list(
    group: &InstanceGroup,
    _settings: &ExportSettings,
) -> Result<Vec<Value>, crate::KubeError> {
    let name = kebab(&group.name);
    let selector = json!({ "app.kubernetes.io/component": name });

    let all_ports: Vec<&gantry_model::PortDef> = group
        .job_references
        .iter()
        .flat_map(|j| &j.properties.bosh_containerization.ports)
        .collect();
    if all_ports.is_empty() {
        return Ok(Vec::new());
    }

    let port_entry = |p: &gantry_model::PortDef| {
        json!({
            "name": &p.name,
            "port": p.external(),
            "targetPort": p.internal,
            "protocol": p.protocol.to_uppercase(),
        })
    };

    // Every generated resource labels itself with its own name.
    let metadata = |service_name: &str| {
        json!({
            "name": service_name,
            "labels": { "app.kubernetes.io/component": service_name },
        })
    };

    let mut services = Vec::new();
    services.push(serde_yaml::to_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": metadata(&name),
        "spec": {
            "selector": &selector,
            "ports": all_ports.iter().map(|p| port_entry(p)).collect::<Vec<_>>(),
        },
    }))?);

    let public_ports: Vec<&&gantry_model::PortDef> =
        all_ports.iter().filter(|p| p.public).collect();
    if !public_ports.is_empty() {
        services.push(serde_yaml::to_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": metadata(&format!("{name}-public")),
            "spec": {
                "type": "LoadBalancer",
                "selector": &selector,
                "ports": public_ports.iter().map(|p| port_entry(p)).collect::<Vec<_>>(),
            },
        }))?);
    }

    if group.has_tag(GroupTag::ActivePassive) {
        services.push(serde_yaml::to_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": metadata(&format!("{name}-set")),
            "spec": {
                "clusterIP": "None",
                "selector": &selector,
                "ports": all_ports.iter().map(|p| port_entry(p)).collect::<Vec<_>>(),
            },
        }))?);
    }

    Ok(services)
}
