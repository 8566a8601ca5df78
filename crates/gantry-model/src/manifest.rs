use crate::job::{Job, LinkInfo};
use crate::release::ReleaseRef;
use crate::run::{PortDef, RoleRun};
use crate::ModelError;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Instance group types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    Bosh,
    BoshTask,
    ColocatedContainer,
}

impl GroupType {
    pub const ALL: [GroupType; 3] = [
        GroupType::Bosh,
        GroupType::BoshTask,
        GroupType::ColocatedContainer,
    ];

    pub fn parse(s: &str) -> Option<GroupType> {
        match s {
            "bosh" => Some(GroupType::Bosh),
            "bosh-task" => Some(GroupType::BoshTask),
            "colocated-container" => Some(GroupType::ColocatedContainer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Bosh => "bosh",
            GroupType::BoshTask => "bosh-task",
            GroupType::ColocatedContainer => "colocated-container",
        }
    }
}

/// The closed set of instance group tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupTag {
    StopOnFailure,
    SequentialStartup,
    ActivePassive,
    IstioManaged,
}

impl GroupTag {
    pub fn parse(s: &str) -> Option<GroupTag> {
        match s {
            "stop-on-failure" => Some(GroupTag::StopOnFailure),
            "sequential-startup" => Some(GroupTag::SequentialStartup),
            "active-passive" => Some(GroupTag::ActivePassive),
            "istio-managed" => Some(GroupTag::IstioManaged),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupTag::StopOnFailure => "stop-on-failure",
            GroupTag::SequentialStartup => "sequential-startup",
            GroupTag::ActivePassive => "active-passive",
            GroupTag::IstioManaged => "istio-managed",
        }
    }
}

/// A configuration template after resolution: stringified value plus whether
/// it came from the manifest-global section or the instance group itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDef {
    pub value: String,
    pub is_global: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub authorization: Authorization,
    #[serde(default)]
    pub templates: BTreeMap<String, Value>,
    /// Union of global and per-group templates, filled by the resolver.
    #[serde(skip)]
    pub resolved_templates: BTreeMap<String, TemplateDef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Authorization {
    #[serde(default)]
    pub accounts: BTreeMap<String, AuthAccount>,
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<AuthRule>>,
    #[serde(default, rename = "cluster-roles")]
    pub cluster_roles: BTreeMap<String, Vec<AuthRule>>,
    #[serde(skip)]
    pub role_used_by: BTreeMap<String, BTreeSet<String>>,
    #[serde(skip)]
    pub cluster_role_used_by: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthAccount {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, rename = "cluster-roles")]
    pub cluster_roles: Vec<String>,
    #[serde(skip)]
    pub used_by: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
pub struct AuthRule {
    #[serde(default, rename = "apiGroups")]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub verbs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub options: VariableOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariableOptions {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Value,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub immutable: bool,
    #[serde(default)]
    pub example: Value,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub previous_names: Vec<String>,
}

/// A `provides:` override in the role manifest, exporting a job's provider
/// under an optional alias.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvideOverride {
    #[serde(default, rename = "as")]
    pub alias: String,
    #[serde(default)]
    pub shared: bool,
}

/// A `consumes:` override in the role manifest, redirecting or silencing one
/// of the job's declared consumers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumeOverride {
    #[serde(default, rename = "from")]
    pub alias: String,
    #[serde(default)]
    pub ignore: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerProperties {
    #[serde(default)]
    pub bosh_containerization: Containerization,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Containerization {
    #[serde(default)]
    pub run: Option<RoleRun>,
    #[serde(default)]
    pub ports: Vec<PortDef>,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub colocated_containers: Vec<String>,
}

/// Reference from an instance group to a job in a loaded release.
///
/// `job`, `resolved_consumes` and `resolved_consumed_by` are written by the
/// resolver; everything else comes from the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct JobReference {
    pub name: String,
    #[serde(default)]
    pub release: String,
    #[serde(default)]
    pub provides: BTreeMap<String, ProvideOverride>,
    #[serde(default)]
    pub consumes: BTreeMap<String, ConsumeOverride>,
    #[serde(default)]
    pub properties: ContainerProperties,
    #[serde(skip)]
    pub job: Option<Arc<Job>>,
    #[serde(skip)]
    pub resolved_consumes: BTreeMap<String, LinkInfo>,
    #[serde(skip)]
    pub resolved_consumed_by: BTreeMap<String, Vec<LinkInfo>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupConfiguration {
    #[serde(default)]
    pub templates: BTreeMap<String, Value>,
}

/// A named collection of job references destined to run co-located.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceGroup {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_feature: String,
    #[serde(default)]
    pub if_feature: String,
    #[serde(default)]
    pub unless_feature: String,
    #[serde(default, rename = "type")]
    pub group_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub environment_scripts: Vec<String>,
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default)]
    pub post_config_scripts: Vec<String>,
    #[serde(default, rename = "jobs")]
    pub job_references: Vec<JobReference>,
    #[serde(default)]
    pub configuration: Option<GroupConfiguration>,
    /// Aggregated from the job references by the resolver.
    #[serde(skip)]
    pub run: Option<RoleRun>,
    /// Own templates plus non-overridden globals, filled by the resolver.
    #[serde(skip)]
    pub resolved_templates: BTreeMap<String, TemplateDef>,
}

impl InstanceGroup {
    pub fn typ(&self) -> Option<GroupType> {
        GroupType::parse(&self.group_type)
    }

    pub fn is_colocated(&self) -> bool {
        self.typ() == Some(GroupType::ColocatedContainer)
    }

    pub fn has_tag(&self, tag: GroupTag) -> bool {
        self.tags.iter().any(|t| GroupTag::parse(t) == Some(tag))
    }

    pub fn lookup_job(&self, name: &str) -> Option<&JobReference> {
        self.job_references.iter().find(|j| j.name == name)
    }

    /// Names of colocated containers requested by any of this group's jobs.
    pub fn colocated_containers(&self) -> Vec<&str> {
        self.job_references
            .iter()
            .flat_map(|j| &j.properties.bosh_containerization.colocated_containers)
            .map(String::as_str)
            .collect()
    }

    /// Relative script paths mapped to their locations next to the manifest.
    /// Absolute paths point inside the container and are skipped.
    pub fn script_paths(&self, manifest_dir: &Path) -> BTreeMap<String, PathBuf> {
        let mut result = BTreeMap::new();
        for list in [
            &self.environment_scripts,
            &self.scripts,
            &self.post_config_scripts,
        ] {
            for script in list {
                if Path::new(script).is_absolute() {
                    continue;
                }
                result.insert(script.clone(), manifest_dir.join(script));
            }
        }
        result
    }

    /// The group's description extended with the list of its jobs.
    pub fn long_description(&self) -> String {
        let mut desc = self.description.clone();
        if !desc.is_empty() {
            desc.push_str("\n\n");
        }
        desc.push_str(&format!(
            "The {} instance group contains the following jobs:",
            self.name
        ));
        for job_ref in &self.job_references {
            desc.push_str(&format!("\n\n- {}", job_ref.name));
            if let Some(job) = &job_ref.job {
                if !job.description.is_empty() {
                    desc.push_str(&format!(": {}", job.description));
                }
            }
        }
        desc
    }
}

/// The top-level role manifest: instance groups, variables, configuration,
/// features, and the releases they pull jobs from.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleManifest {
    #[serde(default)]
    pub instance_groups: Vec<InstanceGroup>,
    #[serde(default)]
    pub configuration: Configuration,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub releases: Vec<ReleaseRef>,
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
    #[serde(skip)]
    pub manifest_file_path: PathBuf,
}

impl RoleManifest {
    /// Parse a role manifest file. Produces the unresolved graph; no
    /// cross-references are checked here, except that template keys must be
    /// strings (they become filesystem paths later, so a non-string key
    /// cannot be processed at all).
    pub fn load_from_file(path: &Path) -> Result<RoleManifest, ModelError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents, path)
    }

    pub fn parse(contents: &str, path: &Path) -> Result<RoleManifest, ModelError> {
        let raw: Value = serde_yaml::from_str(contents).map_err(|e| ModelError::ManifestLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        validate_template_keys(&raw).map_err(|reason| ModelError::ManifestLoad {
            path: path.to_path_buf(),
            reason,
        })?;

        let mut manifest: RoleManifest =
            serde_yaml::from_value(raw).map_err(|e| ModelError::ManifestLoad {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        manifest.manifest_file_path = path.to_path_buf();
        Ok(manifest)
    }

    pub fn lookup_instance_group(&self, name: &str) -> Option<&InstanceGroup> {
        self.instance_groups.iter().find(|g| g.name == name)
    }

    /// Select instance groups by name; empty selection means all groups.
    pub fn select_instance_groups(
        &self,
        names: &[String],
    ) -> Result<Vec<&InstanceGroup>, ModelError> {
        if names.is_empty() {
            return Ok(self.instance_groups.iter().collect());
        }
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let group = self
                .lookup_instance_group(name)
                .ok_or_else(|| ModelError::GroupNotFound(name.clone()))?;
            selected.push(group);
        }
        Ok(selected)
    }

    pub fn manifest_dir(&self) -> &Path {
        self.manifest_file_path.parent().unwrap_or(Path::new("."))
    }
}

/// Reject non-string template keys anywhere in the document before the typed
/// parse, with a message naming the offending key.
fn validate_template_keys(raw: &Value) -> Result<(), String> {
    fn check_templates(templates: &Value, context: &str) -> Result<(), String> {
        if let Some(mapping) = templates.as_mapping() {
            for key in mapping.keys() {
                if !key.is_string() {
                    return Err(format!(
                        "{context}: template key {key:?} is not a string"
                    ));
                }
            }
        }
        Ok(())
    }

    if let Some(templates) = raw.get("configuration").and_then(|c| c.get("templates")) {
        check_templates(templates, "configuration.templates")?;
    }
    if let Some(groups) = raw.get("instance_groups").and_then(Value::as_sequence) {
        for group in groups {
            let name = group
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("<unnamed>");
            if let Some(templates) = group.get("configuration").and_then(|c| c.get("templates")) {
                check_templates(
                    templates,
                    &format!("instance_groups[{name}].configuration.templates"),
                )?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: api
  description: the api
  tags: [sequential-startup]
  jobs:
  - name: server
    release: demo
    provides:
      web: {as: api-web}
    consumes:
      nats: {from: message-bus}
    properties:
      bosh_containerization:
        run:
          scaling: {min: 1, max: 3}
        ports:
        - name: web
          internal: 8080
configuration:
  templates:
    properties.api.port: '((API_PORT))'
  authorization:
    accounts:
      api-account:
        roles: [api-role]
    roles:
      api-role:
      - apiGroups: [""]
        resources: [pods]
        verbs: [get]
variables:
- name: API_PORT
  options:
    description: public port
features:
  autoscaling: false
"#;

    #[test]
    fn parses_untyped_graph() {
        let manifest = RoleManifest::parse(MANIFEST, Path::new("role-manifest.yml")).unwrap();
        assert_eq!(manifest.instance_groups.len(), 1);
        let group = &manifest.instance_groups[0];
        assert_eq!(group.name, "api");
        assert!(group.has_tag(GroupTag::SequentialStartup));

        let job_ref = &group.job_references[0];
        assert_eq!(job_ref.release, "demo");
        assert_eq!(job_ref.provides["web"].alias, "api-web");
        assert_eq!(job_ref.consumes["nats"].alias, "message-bus");
        assert!(job_ref.job.is_none(), "no resolution at parse time");

        assert_eq!(manifest.variables[0].name, "API_PORT");
        assert_eq!(
            manifest.configuration.authorization.accounts["api-account"].roles,
            vec!["api-role"]
        );
        assert_eq!(manifest.features.get("autoscaling"), Some(&false));
    }

    #[test]
    fn rejects_non_string_template_keys() {
        let bad = r#"
configuration:
  templates:
    42: value
"#;
        let err = RoleManifest::parse(bad, Path::new("m.yml")).unwrap_err();
        assert!(err.to_string().contains("not a string"));
    }

    #[test]
    fn rejects_non_string_group_template_keys() {
        let bad = r#"
instance_groups:
- name: api
  configuration:
    templates:
      true: value
"#;
        let err = RoleManifest::parse(bad, Path::new("m.yml")).unwrap_err();
        assert!(err.to_string().contains("instance_groups[api]"));
    }

    #[test]
    fn select_instance_groups_by_name() {
        let manifest = RoleManifest::parse(MANIFEST, Path::new("m.yml")).unwrap();
        let all = manifest.select_instance_groups(&[]).unwrap();
        assert_eq!(all.len(), 1);
        let picked = manifest
            .select_instance_groups(&["api".to_owned()])
            .unwrap();
        assert_eq!(picked[0].name, "api");
        assert!(manifest
            .select_instance_groups(&["ghost".to_owned()])
            .is_err());
    }

    #[test]
    fn group_type_closed_set() {
        assert_eq!(GroupType::parse("bosh"), Some(GroupType::Bosh));
        assert_eq!(GroupType::parse("bosh-task"), Some(GroupType::BoshTask));
        assert_eq!(
            GroupType::parse("colocated-container"),
            Some(GroupType::ColocatedContainer)
        );
        assert_eq!(GroupType::parse("vm"), None);
    }

    #[test]
    fn script_paths_skip_absolute() {
        let mut group: InstanceGroup = serde_yaml::from_str("name: g").unwrap();
        group.scripts = vec!["scripts/setup.sh".to_owned(), "/opt/run.sh".to_owned()];
        let paths = group.script_paths(Path::new("/deploy"));
        assert_eq!(paths.len(), 1);
        assert_eq!(
            paths["scripts/setup.sh"],
            PathBuf::from("/deploy/scripts/setup.sh")
        );
    }
}
