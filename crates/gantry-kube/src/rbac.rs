use crate::{ExportSettings, KubeError};
use gantry_model::Authorization;
use serde_json::json;
use serde_yaml::Value;

/// Metadata block carrying the standard component label every generated
/// resource gets, equal to the resource's own name.
fn metadata(name: &str) -> serde_json::Value {
    json!({
        "name": name,
        "labels": { "app.kubernetes.io/component": name },
    })
}

/// RBAC documents for every account the deployment actually uses:
/// ServiceAccounts, Roles and ClusterRoles (with their rules), and the
/// bindings tying them together.
pub fn new_rbac_list(
    authorization: &Authorization,
    _settings: &ExportSettings,
) -> Result<Vec<Value>, KubeError> {
    let mut docs = Vec::new();

    for (account_name, account) in &authorization.accounts {
        if account.used_by.is_empty() {
            continue;
        }
        docs.push(serde_yaml::to_value(json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": metadata(account_name),
        }))?);

        for role in &account.roles {
            docs.push(serde_yaml::to_value(json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "RoleBinding",
                "metadata": metadata(&format!("{account_name}-{role}-binding")),
                "subjects": [{ "kind": "ServiceAccount", "name": account_name }],
                "roleRef": {
                    "kind": "Role",
                    "name": role,
                    "apiGroup": "rbac.authorization.k8s.io",
                },
            }))?);
        }
        for cluster_role in &account.cluster_roles {
            docs.push(serde_yaml::to_value(json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "ClusterRoleBinding",
                "metadata": metadata(&format!("{account_name}-{cluster_role}-cluster-binding")),
                "subjects": [{ "kind": "ServiceAccount", "name": account_name }],
                "roleRef": {
                    "kind": "ClusterRole",
                    "name": cluster_role,
                    "apiGroup": "rbac.authorization.k8s.io",
                },
            }))?);
        }
    }

    for (role_name, rules) in &authorization.roles {
        if !authorization.role_used_by.contains_key(role_name) {
            continue;
        }
        docs.push(serde_yaml::to_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "Role",
            "metadata": metadata(role_name),
            "rules": rules,
        }))?);
    }
    for (cluster_role_name, rules) in &authorization.cluster_roles {
        if !authorization
            .cluster_role_used_by
            .contains_key(cluster_role_name)
        {
            continue;
        }
        docs.push(serde_yaml::to_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": metadata(cluster_role_name),
            "rules": rules,
        }))?);
    }

    Ok(docs)
}
