use crate::ModelError;
use gantry_store::{extract_tgz, verify_sha1};
use std::path::{Path, PathBuf};

/// Lightweight reference to a package: enough to locate its compiled output
/// and to wait on its build, without a back-pointer into the release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    pub name: String,
    pub fingerprint: String,
    pub sha1: String,
}

/// One build unit of a release.
///
/// `fingerprint` is the source hash declared by the release manifest and is
/// immutable once loaded; two packages with equal fingerprints are
/// interchangeable regardless of which release they came from. `sha1` is the
/// digest of the archive itself, verified lazily the first time the archive
/// is used.
#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub fingerprint: String,
    pub sha1: String,
    pub release_name: String,
    pub release_version: String,
    /// Path to the `.tgz` archive holding the package sources.
    pub path: PathBuf,
    pub dependencies: Vec<PackageRef>,
}

impl Package {
    /// Check the archive on disk against the manifest's declared SHA-1.
    pub fn validate_sha1(&self) -> Result<(), ModelError> {
        verify_sha1(&self.path, &self.sha1)?;
        Ok(())
    }

    /// Verify and extract the package sources into `destination/<name>`.
    /// Returns the extraction directory.
    pub fn extract(&self, destination: &Path) -> Result<PathBuf, ModelError> {
        self.validate_sha1()?;
        let target = destination.join(&self.name);
        extract_tgz(&self.path, &target)?;
        Ok(target)
    }

    pub fn as_ref(&self) -> PackageRef {
        PackageRef {
            name: self.name.clone(),
            fingerprint: self.fingerprint.clone(),
            sha1: self.sha1.clone(),
        }
    }
}
