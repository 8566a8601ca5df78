//! Synthetic release builders.
//!
//! Tests across the workspace need real release directories: archives with
//! correct digests, a `release.MF` that refers to them, and job specs inside
//! the job archives. `ReleaseBuilder` constructs those on disk so the loader
//! path is exercised for real instead of being stubbed out.

use crate::release::{Release, ReleaseKind};
use crate::ModelError;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::fs;
use std::path::{Path, PathBuf};

/// Write a `.tgz` with the given `(path, content)` entries and return the
/// archive's hex SHA-1.
pub fn write_tgz(path: &Path, files: &[(&str, &str)]) -> Result<String, ModelError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(path)?;
    let gz = GzEncoder::new(file, Compression::default());
    let mut ar = tar::Builder::new(gz);
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        ar.append_data(&mut header, name, content.as_bytes())?;
    }
    ar.into_inner()?.finish()?;
    Ok(gantry_store::file_sha1(path)?)
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct FixturePackage {
    name: String,
    dependencies: Vec<String>,
}

#[derive(Debug, Clone)]
struct FixtureJob {
    manifest: String,
    templates: Vec<(String, String)>,
}

#[derive(Serialize)]
struct MfEntry {
    name: String,
    version: String,
    fingerprint: String,
    sha1: String,
}

#[derive(Serialize)]
struct MfPackage {
    name: String,
    version: String,
    fingerprint: String,
    sha1: String,
    dependencies: Vec<String>,
}

#[derive(Serialize)]
struct MfRelease {
    name: String,
    version: String,
    commit_hash: String,
    uncommitted_changes: bool,
    jobs: Vec<MfEntry>,
    packages: Vec<MfPackage>,
}

/// Builds a final-release directory under a parent path.
#[derive(Debug, Clone)]
pub struct ReleaseBuilder {
    name: String,
    version: String,
    packages: Vec<FixturePackage>,
    jobs: Vec<FixtureJob>,
}

impl ReleaseBuilder {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_owned(),
            version: version.to_owned(),
            packages: Vec::new(),
            jobs: Vec::new(),
        }
    }

    /// Add a package with the given intra-release dependencies.
    pub fn package(mut self, name: &str, dependencies: &[&str]) -> Self {
        self.packages.push(FixturePackage {
            name: name.to_owned(),
            dependencies: dependencies.iter().map(|s| (*s).to_owned()).collect(),
        });
        self
    }

    /// Add a job with a minimal generated `job.MF` listing `packages`.
    pub fn job(self, name: &str, packages: &[&str]) -> Self {
        let pkg_list = if packages.is_empty() {
            "packages: []".to_owned()
        } else {
            let items = packages
                .iter()
                .map(|p| format!("- {p}"))
                .collect::<Vec<_>>()
                .join("\n");
            format!("packages:\n{items}")
        };
        let manifest = format!("name: {name}\ndescription: \"\"\n{pkg_list}\ntemplates: {{}}\n");
        self.job_from_mf(&manifest, &[])
    }

    /// Add a job from a complete `job.MF` document plus template files.
    pub fn job_from_mf(mut self, manifest: &str, templates: &[(&str, &str)]) -> Self {
        self.jobs.push(FixtureJob {
            manifest: manifest.to_owned(),
            templates: templates
                .iter()
                .map(|(n, c)| ((*n).to_owned(), (*c).to_owned()))
                .collect(),
        });
        self
    }

    /// Materialize the release under `parent/<name>` and load it.
    pub fn build(self, parent: &Path) -> Result<Release, ModelError> {
        let release_dir = self.write(parent)?;
        Release::load(&release_dir, ReleaseKind::Final)
    }

    /// Materialize the release directory without loading it.
    pub fn write(self, parent: &Path) -> Result<PathBuf, ModelError> {
        let release_dir = parent.join(&self.name);
        fs::create_dir_all(release_dir.join("jobs"))?;
        fs::create_dir_all(release_dir.join("packages"))?;

        let mut mf_packages = Vec::new();
        for pkg in &self.packages {
            let archive = release_dir.join("packages").join(format!("{}.tgz", pkg.name));
            let packaging = format!("#!/bin/bash\necho building {}\n", pkg.name);
            let sha1 = write_tgz(&archive, &[("packaging", packaging.as_str())])?;
            // The fingerprint covers name and dependency set, mirroring a
            // source hash: equal inputs yield equal fingerprints across
            // releases.
            let fingerprint = sha1_hex(
                format!("pkg:{}:{}:{}", pkg.name, self.version, pkg.dependencies.join(","))
                    .as_bytes(),
            );
            mf_packages.push(MfPackage {
                name: pkg.name.clone(),
                version: self.version.clone(),
                fingerprint,
                sha1,
                dependencies: pkg.dependencies.clone(),
            });
        }

        let mut mf_jobs = Vec::new();
        for job in &self.jobs {
            let name = job_name(&job.manifest)?;
            let mut entries: Vec<(&str, &str)> = vec![("job.MF", job.manifest.as_str())];
            let template_paths: Vec<(String, String)> = job
                .templates
                .iter()
                .map(|(n, c)| (format!("templates/{n}"), c.clone()))
                .collect();
            for (path, content) in &template_paths {
                entries.push((path.as_str(), content.as_str()));
            }
            let archive = release_dir.join("jobs").join(format!("{name}.tgz"));
            let sha1 = write_tgz(&archive, &entries)?;
            mf_jobs.push(MfEntry {
                name,
                version: self.version.clone(),
                fingerprint: sha1_hex(job.manifest.as_bytes()),
                sha1,
            });
        }

        let manifest = MfRelease {
            name: self.name.clone(),
            version: self.version.clone(),
            commit_hash: "0000000".to_owned(),
            uncommitted_changes: false,
            jobs: mf_jobs,
            packages: mf_packages,
        };
        let rendered = serde_yaml::to_string(&manifest).map_err(|e| ModelError::ReleaseLoad {
            release: self.name.clone(),
            path: release_dir.clone(),
            reason: format!("cannot render fixture release.MF: {e}"),
        })?;
        fs::write(release_dir.join("release.MF"), rendered)?;
        Ok(release_dir)
    }
}

fn job_name(manifest: &str) -> Result<String, ModelError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(manifest).map_err(|e| ModelError::ManifestLoad {
            path: PathBuf::from("<fixture job.MF>"),
            reason: e.to_string(),
        })?;
    value
        .get("name")
        .and_then(|n| n.as_str())
        .map(str::to_owned)
        .ok_or_else(|| ModelError::ManifestLoad {
            path: PathBuf::from("<fixture job.MF>"),
            reason: "fixture job.MF has no name".to_owned(),
        })
}
