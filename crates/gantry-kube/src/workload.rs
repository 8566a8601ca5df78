use crate::{ExportSettings, KubeError};
use gantry_model::{kebab, GroupType, HealthProbe, InstanceGroup};
use serde_json::json;
use serde_yaml::Value;

/// The controller document for one instance group: a `Deployment` for bosh
/// groups, a `Job` for bosh-task groups. In helm mode the replica count is
/// templated on `.Values.sizing.<group>.count` with the HA fallback.
pub fn new_workload(
    group: &InstanceGroup,
    image: &str,
    settings: &ExportSettings,
) -> Result<Value, KubeError> {
    let run = group
        .run
        .as_ref()
        .ok_or_else(|| KubeError::MissingRun(group.name.clone()))?;

    let name = kebab(&group.name);
    let is_task = group.typ() == Some(GroupType::BoshTask);

    let mut container = json!({
        "name": &name,
        "image": image,
    });
    let ports: Vec<serde_json::Value> = group
        .job_references
        .iter()
        .flat_map(|j| &j.properties.bosh_containerization.ports)
        .map(|p| {
            json!({
                "name": &p.name,
                "containerPort": p.internal,
                "protocol": p.protocol.to_uppercase(),
            })
        })
        .collect();
    if !ports.is_empty() {
        container["ports"] = serde_json::Value::Array(ports);
    }

    let mut resources = json!({});
    if let Some(memory) = &run.memory {
        if let Some(request) = memory.request {
            resources["requests"]["memory"] = json!(format!("{request}Mi"));
        }
        if let Some(limit) = memory.limit {
            resources["limits"]["memory"] = json!(format!("{limit}Mi"));
        }
    }
    if let Some(cpu) = &run.cpu {
        if let Some(request) = cpu.request {
            resources["requests"]["cpu"] = json!(format!("{request}"));
        }
        if let Some(limit) = cpu.limit {
            resources["limits"]["cpu"] = json!(format!("{limit}"));
        }
    }
    if resources != json!({}) {
        container["resources"] = resources;
    }

    if let Some(healthcheck) = &run.healthcheck {
        if let Some(readiness) = &healthcheck.readiness {
            container["readinessProbe"] = probe(readiness);
        }
        if let Some(liveness) = &healthcheck.liveness {
            container["livenessProbe"] = probe(liveness);
        }
    }

    if !run.capabilities.is_empty() {
        container["securityContext"] =
            json!({ "capabilities": { "add": &run.capabilities } });
    }

    let mut pod_spec = json!({
        "containers": [container],
    });
    if !run.service_account.is_empty() {
        pod_spec["serviceAccountName"] = json!(&run.service_account);
    }
    if is_task {
        pod_spec["restartPolicy"] = json!("OnFailure");
    }
    if let Some(affinity) = &run.affinity {
        if let Some(anti) = &affinity.pod_anti_affinity {
            let anti_json: serde_json::Value = serde_yaml::from_value(anti.clone())
                .map_err(KubeError::Serialization)?;
            pod_spec["affinity"] = json!({ "podAntiAffinity": anti_json });
        }
    }

    let labels = json!({ "app.kubernetes.io/component": &name });
    let pod_template = json!({
        "metadata": { "labels": &labels },
        "spec": pod_spec,
    });

    let doc = if is_task {
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": &name, "labels": &labels },
            "spec": { "template": pod_template },
        })
    } else {
        let replicas: serde_json::Value = if settings.helm_chart {
            let scaling = run.scaling.clone().unwrap_or_default();
            json!(format!(
                "{{{{ if .Values.sizing.{name}.count }}}}{{{{ .Values.sizing.{name}.count }}}}{{{{ else if .Values.config.HA }}}}{ha}{{{{ else }}}}{min}{{{{ end }}}}",
                ha = scaling.ha(),
                min = scaling.min,
            ))
        } else {
            json!(run.scaling.clone().unwrap_or_default().min)
        };
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": &name, "labels": &labels },
            "spec": {
                "replicas": replicas,
                "selector": { "matchLabels": &labels },
                "template": pod_template,
            },
        })
    };

    Ok(serde_yaml::to_value(doc)?)
}

fn probe(spec: &HealthProbe) -> serde_json::Value {
    let mut probe = json!({});
    if !spec.command.is_empty() {
        probe["exec"] = json!({ "command": &spec.command });
    } else if !spec.url.is_empty() {
        let (path, port) = split_url(&spec.url, spec.port);
        probe["httpGet"] = json!({ "path": path, "port": port });
        if !spec.headers.is_empty() {
            let headers: Vec<serde_json::Value> = spec
                .headers
                .iter()
                .map(|(name, value)| json!({ "name": name, "value": value }))
                .collect();
            probe["httpGet"]["httpHeaders"] = serde_json::Value::Array(headers);
        }
    } else if spec.port != 0 {
        probe["tcpSocket"] = json!({ "port": spec.port });
    }
    if spec.initial_delay != 0 {
        probe["initialDelaySeconds"] = json!(spec.initial_delay);
    }
    if spec.period != 0 {
        probe["periodSeconds"] = json!(spec.period);
    }
    if spec.timeout != 0 {
        probe["timeoutSeconds"] = json!(spec.timeout);
    }
    probe
}

/// Pull the path and port out of a probe URL; `default_port` wins when the
/// URL carries none.
fn split_url(url: &str, default_port: u32) -> (String, u32) {
    let without_scheme = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let (authority, path) = match without_scheme.find('/') {
        Some(index) => (
            &without_scheme[..index],
            without_scheme[index..].to_owned(),
        ),
        None => (without_scheme, "/".to_owned()),
    };
    let port = authority
        .rsplit_once(':')
        .and_then(|(_, p)| p.parse().ok())
        .unwrap_or(if default_port != 0 { default_port } else { 80 });
    (path, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(yaml: &str) -> InstanceGroup {
        let mut group: InstanceGroup = serde_yaml::from_str(yaml).unwrap();
        gantry_model::calculate_role_run(&mut group)
            .into_result()
            .unwrap();
        if group.group_type.is_empty() {
            group.group_type = "bosh".to_owned();
        }
        group
    }

    const API_GROUP: &str = r#"
name: api
jobs:
- name: svc
  release: demo
  properties:
    bosh_containerization:
      run:
        scaling: {min: 2, max: 4, ha: 3}
        memory: {request: 256, limit: 512}
        healthcheck:
          readiness: {url: "http://container:8080/health"}
        service-account: api-account
      ports:
      - {name: web, internal: 8080}
"#;

    #[test]
    fn deployment_for_bosh_group() {
        let group = group(API_GROUP);
        let doc = new_workload(&group, "gantry-api:v1", &ExportSettings::default()).unwrap();

        assert_eq!(doc["kind"].as_str(), Some("Deployment"));
        assert_eq!(doc["spec"]["replicas"].as_u64(), Some(2));
        let container = &doc["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"].as_str(), Some("gantry-api:v1"));
        assert_eq!(
            container["resources"]["limits"]["memory"].as_str(),
            Some("512Mi")
        );
        assert_eq!(
            container["readinessProbe"]["httpGet"]["path"].as_str(),
            Some("/health")
        );
        assert_eq!(
            container["readinessProbe"]["httpGet"]["port"].as_u64(),
            Some(8080)
        );
        assert_eq!(
            doc["spec"]["template"]["spec"]["serviceAccountName"].as_str(),
            Some("api-account")
        );
    }

    #[test]
    fn job_for_bosh_task_group() {
        let group = group(
            r#"
name: migrate
type: bosh-task
jobs:
- name: migrate
  release: demo
  properties:
    bosh_containerization:
      run:
        scaling: {min: 1, max: 1}
"#,
        );
        let doc = new_workload(&group, "img", &ExportSettings::default()).unwrap();
        assert_eq!(doc["kind"].as_str(), Some("Job"));
        assert_eq!(
            doc["spec"]["template"]["spec"]["restartPolicy"].as_str(),
            Some("OnFailure")
        );
    }

    #[test]
    fn helm_mode_templates_replicas() {
        let group = group(API_GROUP);
        let settings = ExportSettings {
            helm_chart: true,
            ..ExportSettings::default()
        };
        let doc = new_workload(&group, "img", &settings).unwrap();
        let replicas = doc["spec"]["replicas"].as_str().unwrap();
        assert!(replicas.contains(".Values.sizing.api.count"));
        assert!(replicas.contains(".Values.config.HA"));
        assert!(replicas.contains('3'), "HA count in template: {replicas}");
    }

    #[test]
    fn url_splitting() {
        assert_eq!(split_url("http://host:9090/ping", 0), ("/ping".to_owned(), 9090));
        assert_eq!(split_url("http://host/ping", 8080), ("/ping".to_owned(), 8080));
        assert_eq!(split_url("host", 0), ("/".to_owned(), 80));
    }
}
