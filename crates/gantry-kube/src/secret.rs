use crate::{ExportSettings, KubeError};
use gantry_model::RoleManifest;
use serde_json::json;
use serde_yaml::Value;

/// One Secret holding every secret variable of the deployment, keyed by
/// variable name. Concrete mode takes the declared default (or empty);
/// helm mode defers to `.Values.secrets.<NAME>`.
pub fn new_secret(
    manifest: &RoleManifest,
    settings: &ExportSettings,
) -> Result<Option<Value>, KubeError> {
    let mut data = serde_json::Map::new();
    for variable in &manifest.variables {
        if !variable.options.secret {
            continue;
        }
        let value = if settings.helm_chart {
            format!("{{{{ .Values.secrets.{} | quote }}}}", variable.name)
        } else {
            match &variable.options.default {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => serde_yaml::to_string(other)?.trim_end().to_owned(),
            }
        };
        data.insert(variable.name.clone(), json!(value));
    }
    if data.is_empty() {
        return Ok(None);
    }

    Ok(Some(serde_yaml::to_value(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": "deployment-secrets",
            "labels": { "app.kubernetes.io/component": "deployment-secrets" },
        },
        "type": "Opaque",
        "stringData": data,
    }))?))
}
