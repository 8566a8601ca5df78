use crate::package::{Package, PackageRef};
use crate::ModelError;
use gantry_store::{extract_tgz, verify_sha1};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A resolved link endpoint: which job in which instance group provides (or
/// consumes) a named, typed link, and under which service name it is
/// reachable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub link_type: String,
    pub role_name: String,
    pub job_name: String,
    pub service_name: String,
}

/// A link a job exports, as declared in its `job.MF`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvidedLink {
    pub name: String,
    pub link_type: String,
    pub properties: Vec<String>,
}

/// A link a job wants, as declared in its `job.MF`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedLink {
    pub name: String,
    pub link_type: String,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTemplate {
    pub source_path: String,
    pub destination_path: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct JobProperty {
    pub name: String,
    pub description: String,
    pub default: Value,
    pub example: Value,
}

/// One runtime unit of a release.
///
/// The archive is extracted once, at load time, into a scratch directory to
/// read `job.MF` and the template files; afterwards only the metadata lives
/// in memory. Properties are kept sorted by name so downstream hashing is
/// stable.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub version: String,
    pub fingerprint: String,
    pub sha1: String,
    pub release_name: String,
    pub path: PathBuf,
    pub description: String,
    pub templates: Vec<JobTemplate>,
    pub packages: Vec<PackageRef>,
    pub properties: Vec<JobProperty>,
    pub available_providers: BTreeMap<String, ProvidedLink>,
    pub desired_consumers: Vec<ConsumedLink>,
}

/// The shape of a `job.MF` document.
#[derive(Debug, Deserialize)]
struct JobSpec {
    #[allow(dead_code)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    templates: BTreeMap<String, String>,
    #[serde(default)]
    properties: BTreeMap<String, PropertySpec>,
    #[serde(default)]
    consumes: Vec<ConsumesSpec>,
    #[serde(default)]
    provides: Vec<ProvidesSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct PropertySpec {
    #[serde(default)]
    description: String,
    #[serde(default)]
    default: Value,
    #[serde(default)]
    example: Value,
}

#[derive(Debug, Deserialize)]
struct ConsumesSpec {
    name: String,
    #[serde(default, rename = "type")]
    link_type: String,
    #[serde(default)]
    optional: bool,
}

#[derive(Debug, Deserialize)]
struct ProvidesSpec {
    name: String,
    #[serde(default, rename = "type")]
    link_type: String,
    #[serde(default)]
    properties: Vec<String>,
}

impl Job {
    pub fn validate_sha1(&self) -> Result<(), ModelError> {
        verify_sha1(&self.path, &self.sha1)?;
        Ok(())
    }

    /// Verify and extract the job archive into `destination/<name>`.
    pub fn extract(&self, destination: &Path) -> Result<PathBuf, ModelError> {
        self.validate_sha1()?;
        let target = destination.join(&self.name);
        extract_tgz(&self.path, &target)?;
        Ok(target)
    }

    pub fn property(&self, name: &str) -> Option<&JobProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Load a job from its archive: extract to a scratch directory, parse
    /// `job.MF`, read template contents, and resolve package references
    /// against the owning release's package set.
    pub(crate) fn load(
        name: String,
        version: String,
        fingerprint: String,
        sha1: String,
        release_name: &str,
        path: PathBuf,
        release_packages: &[Arc<Package>],
    ) -> Result<Job, ModelError> {
        let scratch = tempfile::tempdir()?;
        verify_sha1(&path, &sha1)?;
        let job_dir = scratch.path().join(&name);
        extract_tgz(&path, &job_dir)?;

        let spec_path = job_dir.join("job.MF");
        let spec_contents = std::fs::read_to_string(&spec_path)?;
        let spec: JobSpec = serde_yaml::from_str(&spec_contents).map_err(|e| {
            ModelError::ReleaseLoad {
                release: release_name.to_owned(),
                path: path.clone(),
                reason: format!("cannot parse job.MF for job {name}: {e}"),
            }
        })?;

        let mut packages = Vec::with_capacity(spec.packages.len());
        for pkg_name in &spec.packages {
            let dependency = release_packages
                .iter()
                .find(|p| &p.name == pkg_name)
                .ok_or_else(|| ModelError::ReleaseLoad {
                    release: release_name.to_owned(),
                    path: path.clone(),
                    reason: format!("cannot find package {pkg_name} for job {name}"),
                })?;
            packages.push(Package::as_ref(dependency));
        }

        let mut templates = Vec::with_capacity(spec.templates.len());
        for (source, destination) in &spec.templates {
            let template_path = job_dir.join("templates").join(source);
            let content =
                std::fs::read_to_string(&template_path).map_err(|e| ModelError::ReleaseLoad {
                    release: release_name.to_owned(),
                    path: path.clone(),
                    reason: format!("cannot read template {source} of job {name}: {e}"),
                })?;
            templates.push(JobTemplate {
                source_path: source.clone(),
                destination_path: destination.clone(),
                content,
            });
        }

        // BTreeMap iteration keeps the properties sorted by name.
        let properties = spec
            .properties
            .into_iter()
            .map(|(prop_name, p)| JobProperty {
                name: prop_name,
                description: p.description,
                default: p.default,
                example: p.example,
            })
            .collect();

        let mut available_providers = BTreeMap::new();
        for provides in spec.provides {
            if provides.link_type.is_empty() {
                return Err(ModelError::ReleaseLoad {
                    release: release_name.to_owned(),
                    path,
                    reason: format!("job {name} provider {} has no type", provides.name),
                });
            }
            available_providers.insert(
                provides.name.clone(),
                ProvidedLink {
                    name: provides.name,
                    link_type: provides.link_type,
                    properties: provides.properties,
                },
            );
        }

        let mut desired_consumers = Vec::with_capacity(spec.consumes.len());
        for consumes in spec.consumes {
            if consumes.link_type.is_empty() {
                return Err(ModelError::ReleaseLoad {
                    release: release_name.to_owned(),
                    path,
                    reason: format!("job {name} consumer {} has no type", consumes.name),
                });
            }
            desired_consumers.push(ConsumedLink {
                name: consumes.name,
                link_type: consumes.link_type,
                optional: consumes.optional,
            });
        }

        Ok(Job {
            name,
            version,
            fingerprint,
            sha1,
            release_name: release_name.to_owned(),
            path,
            description: spec.description,
            templates,
            packages,
            properties,
            available_providers,
            desired_consumers,
        })
    }
}
