use crate::{
    new_rbac_list, new_secret, new_service_list, new_workload, ExportSettings, KubeError,
};
use gantry_model::{kebab, InstanceGroup, RoleManifest};
use serde_json::json;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Write the deployment descriptors for the selected instance groups.
///
/// Concrete mode writes plain YAML under `<out>/kube/`; helm mode writes a
/// chart under `<out>/helm/` with `Chart.yaml`, a generated `values.yaml`,
/// and one template per group, wrapped in its feature condition when the
/// group is feature-guarded.
pub fn write_deployment(
    manifest: &RoleManifest,
    groups: &[&InstanceGroup],
    images: &BTreeMap<String, String>,
    settings: &ExportSettings,
    out_dir: &Path,
) -> Result<(), KubeError> {
    let base = if settings.helm_chart {
        let chart_dir = out_dir.join("helm");
        fs::create_dir_all(chart_dir.join("templates"))?;
        fs::write(chart_dir.join("Chart.yaml"), chart_yaml(settings))?;
        fs::write(
            chart_dir.join("values.yaml"),
            values_yaml(manifest, groups, settings)?,
        )?;
        chart_dir.join("templates")
    } else {
        let kube_dir = out_dir.join("kube");
        fs::create_dir_all(&kube_dir)?;
        kube_dir
    };

    for group in groups {
        let image = images
            .get(&group.name)
            .cloned()
            .unwrap_or_else(|| format!("{}-{}", settings.repository, kebab(&group.name)));
        let mut docs = vec![new_workload(group, &image, settings)?];
        docs.extend(new_service_list(group, settings)?);
        let comment: String = group
            .long_description()
            .lines()
            .map(|line| format!("# {line}\n"))
            .collect();
        let rendered = format!("{comment}{}", render_docs(&docs)?);
        let rendered = wrap_in_feature_condition(group, rendered);
        fs::write(base.join(format!("{}.yaml", kebab(&group.name))), rendered)?;
    }

    let rbac = new_rbac_list(&manifest.configuration.authorization, settings)?;
    if !rbac.is_empty() {
        fs::write(base.join("auth.yaml"), render_docs(&rbac)?)?;
    }
    if let Some(secret) = new_secret(manifest, settings)? {
        fs::write(base.join("secrets.yaml"), render_docs(&[secret])?)?;
    }

    info!(
        "wrote {} deployment to {}",
        if settings.helm_chart { "helm" } else { "kube" },
        out_dir.display()
    );
    Ok(())
}

fn render_docs(docs: &[Value]) -> Result<String, KubeError> {
    let mut out = String::new();
    for doc in docs {
        if !out.is_empty() {
            out.push_str("---\n");
        }
        out.push_str(&serde_yaml::to_string(doc)?);
    }
    Ok(out)
}

/// Feature-guarded groups only materialize when the chart enables them.
fn wrap_in_feature_condition(group: &InstanceGroup, rendered: String) -> String {
    let condition = if !group.if_feature.is_empty() {
        Some(format!("{{{{- if .Values.enable.{} }}}}", group.if_feature))
    } else if !group.default_feature.is_empty() {
        Some(format!(
            "{{{{- if .Values.enable.{} }}}}",
            group.default_feature
        ))
    } else if !group.unless_feature.is_empty() {
        Some(format!(
            "{{{{- if not .Values.enable.{} }}}}",
            group.unless_feature
        ))
    } else {
        None
    };
    match condition {
        Some(open) => format!("{open}\n{rendered}{{{{- end }}}}\n"),
        None => rendered,
    }
}

fn chart_yaml(settings: &ExportSettings) -> String {
    format!(
        concat!(
            "apiVersion: v2\n",
            "name: {name}\n",
            "description: Deployment chart generated by gantry\n",
            "version: {version}\n",
            "appVersion: \"{version}\"\n",
        ),
        name = if settings.repository.is_empty() {
            "gantry-deployment"
        } else {
            settings.repository.as_str()
        },
        version = settings.tool_version,
    )
}

/// Generated defaults: per-group sizing, feature switches, registry
/// coordinates, and empty slots for every secret variable.
fn values_yaml(
    manifest: &RoleManifest,
    groups: &[&InstanceGroup],
    settings: &ExportSettings,
) -> Result<String, KubeError> {
    let mut sizing = serde_json::Map::new();
    for group in groups {
        let scaling = group
            .run
            .as_ref()
            .and_then(|r| r.scaling.clone())
            .unwrap_or_default();
        sizing.insert(
            kebab(&group.name),
            json!({ "count": serde_json::Value::Null, "min": scaling.min, "max": scaling.max }),
        );
    }

    let mut secrets = serde_json::Map::new();
    for variable in &manifest.variables {
        if variable.options.secret {
            secrets.insert(variable.name.clone(), serde_json::Value::Null);
        }
    }

    let values = json!({
        "config": { "HA": false },
        "enable": &manifest.features,
        "sizing": sizing,
        "secrets": secrets,
        "kube": {
            "registry": { "hostname": &settings.registry },
            "organization": &settings.organization,
        },
    });
    Ok(serde_yaml::to_string(&values)?)
}
