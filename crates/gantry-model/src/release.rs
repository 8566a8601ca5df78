use crate::job::Job;
use crate::package::{Package, PackageRef};
use crate::ModelError;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const MANIFEST_FILE: &str = "release.MF";
const JOBS_DIR: &str = "jobs";
const PACKAGES_DIR: &str = "packages";

/// Reference to a release as it appears in a role manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseRef {
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub version: String,
    #[serde(default)]
    pub sha1: String,
}

/// Where a release keeps its archives.
#[derive(Debug, Clone)]
pub enum ReleaseKind {
    /// Final release: archives at `jobs/<name>.tgz` and `packages/<name>.tgz`.
    Final,
    /// Dev release: archives in a shared cache directory, indexed by SHA-1.
    Dev { cache_dir: PathBuf },
}

/// A loaded release: metadata plus the job and package object graph.
///
/// Loading records names, versions, fingerprints, digests and archive paths;
/// package archives are not touched, and job archives are extracted only to
/// read their `job.MF`. Archive digests are verified on demand, the first
/// time an archive is actually used.
#[derive(Debug)]
pub struct Release {
    pub name: String,
    pub version: String,
    pub commit_hash: String,
    pub uncommitted_changes: bool,
    pub path: PathBuf,
    pub kind: ReleaseKind,
    pub jobs: Vec<Arc<Job>>,
    pub packages: Vec<Arc<Package>>,
    pub license_files: BTreeMap<String, Vec<u8>>,
}

/// The shape of a `release.MF` document.
#[derive(Debug, Deserialize)]
struct ReleaseManifest {
    name: String,
    #[serde(deserialize_with = "scalar_string")]
    version: String,
    #[serde(default)]
    commit_hash: String,
    #[serde(default)]
    uncommitted_changes: bool,
    #[serde(default)]
    jobs: Vec<ManifestJob>,
    #[serde(default)]
    packages: Vec<ManifestPackage>,
}

#[derive(Debug, Deserialize)]
struct ManifestJob {
    name: String,
    #[serde(default, deserialize_with = "scalar_string")]
    version: String,
    fingerprint: String,
    sha1: String,
}

#[derive(Debug, Deserialize)]
struct ManifestPackage {
    name: String,
    #[serde(default, deserialize_with = "scalar_string")]
    version: String,
    fingerprint: String,
    sha1: String,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// Accept YAML scalars (strings, numbers, booleans) where a string is
/// expected; release manifests routinely carry bare numeric versions.
fn scalar_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = serde_yaml::Value::deserialize(deserializer)?;
    match value {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a scalar, got {other:?}"
        ))),
    }
}

/// Rewrite the broken `!binary` tag Psych emits to the correct `!!binary`,
/// so base64 blocks decode as byte strings downstream.
pub(crate) fn repair_binary_tag(input: &[u8]) -> Vec<u8> {
    const NEEDLE: &[u8] = b"!binary |-\n";
    let mut out = Vec::with_capacity(input.len() + 16);
    let mut i = 0;
    while i < input.len() {
        if input[i..].starts_with(NEEDLE) && (i == 0 || input[i - 1] != b'!') {
            out.extend_from_slice(b"!!binary |-\n");
            i += NEEDLE.len();
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    out
}

impl Release {
    /// Load a release from its directory.
    pub fn load(path: &Path, kind: ReleaseKind) -> Result<Release, ModelError> {
        let load_err = |reason: String| ModelError::ReleaseLoad {
            release: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            reason,
        };

        validate_path_structure(path, &kind).map_err(load_err)?;

        let manifest_path = path.join(MANIFEST_FILE);
        let raw = std::fs::read(&manifest_path)?;
        let repaired = repair_binary_tag(&raw);
        let manifest: ReleaseManifest = serde_yaml::from_slice(&repaired)
            .map_err(|e| load_err(format!("cannot parse {MANIFEST_FILE}: {e}")))?;

        let release_err = |reason: String| ModelError::ReleaseLoad {
            release: manifest.name.clone(),
            path: path.to_path_buf(),
            reason,
        };

        // First pass: construct packages without dependencies so the
        // dependency graph can refer to packages in any manifest order.
        let mut packages = Vec::with_capacity(manifest.packages.len());
        for entry in &manifest.packages {
            packages.push(Package {
                name: entry.name.clone(),
                version: entry.version.clone(),
                fingerprint: entry.fingerprint.clone(),
                sha1: entry.sha1.clone(),
                release_name: manifest.name.clone(),
                release_version: manifest.version.clone(),
                path: archive_path(path, &kind, PACKAGES_DIR, &entry.name, &entry.sha1),
                dependencies: Vec::new(),
            });
        }

        // Second pass: resolve dependency names within the same release.
        let by_name: BTreeMap<String, PackageRef> = packages
            .iter()
            .map(|p| (p.name.clone(), p.as_ref()))
            .collect();
        for (pkg, entry) in packages.iter_mut().zip(&manifest.packages) {
            for dep_name in &entry.dependencies {
                let dep = by_name.get(dep_name).ok_or_else(|| {
                    release_err(format!(
                        "package {} depends on unknown package {dep_name}",
                        entry.name
                    ))
                })?;
                pkg.dependencies.push(dep.clone());
            }
        }
        let packages: Vec<Arc<Package>> = packages.into_iter().map(Arc::new).collect();

        let mut jobs = Vec::with_capacity(manifest.jobs.len());
        for entry in &manifest.jobs {
            let job = Job::load(
                entry.name.clone(),
                entry.version.clone(),
                entry.fingerprint.clone(),
                entry.sha1.clone(),
                &manifest.name,
                archive_path(path, &kind, JOBS_DIR, &entry.name, &entry.sha1),
                &packages,
            )?;
            jobs.push(Arc::new(job));
        }

        let mut license_files = BTreeMap::new();
        let license_path = path.join("LICENSE");
        if license_path.exists() {
            license_files.insert("LICENSE".to_owned(), std::fs::read(&license_path)?);
        }

        debug!(
            "loaded release {} v{}: {} jobs, {} packages",
            manifest.name,
            manifest.version,
            jobs.len(),
            packages.len()
        );

        Ok(Release {
            name: manifest.name,
            version: manifest.version,
            commit_hash: manifest.commit_hash,
            uncommitted_changes: manifest.uncommitted_changes,
            path: path.to_path_buf(),
            kind,
            jobs,
            packages,
            license_files,
        })
    }

    pub fn lookup_package(&self, name: &str) -> Option<&Arc<Package>> {
        self.packages.iter().find(|p| p.name == name)
    }

    pub fn lookup_job(&self, name: &str) -> Option<&Arc<Job>> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

fn archive_path(release_path: &Path, kind: &ReleaseKind, dir: &str, name: &str, sha1: &str) -> PathBuf {
    match kind {
        ReleaseKind::Final => release_path.join(dir).join(format!("{name}.tgz")),
        ReleaseKind::Dev { cache_dir } => cache_dir.join(sha1),
    }
}

fn validate_path_structure(path: &Path, kind: &ReleaseKind) -> Result<(), String> {
    if !path.is_dir() {
        return Err(format!("release directory {} does not exist", path.display()));
    }
    if !path.join(MANIFEST_FILE).is_file() {
        return Err(format!("{MANIFEST_FILE} missing in {}", path.display()));
    }
    if matches!(kind, ReleaseKind::Final) {
        for dir in [PACKAGES_DIR, JOBS_DIR] {
            if !path.join(dir).is_dir() {
                return Err(format!("{dir} directory missing in {}", path.display()));
            }
        }
    }
    Ok(())
}
