use crate::{ExportSettings, KubeError};
use gantry_model::{
    aggregate_signatures, kebab, role_dev_version, InstanceGroup, Opinions, Package, Release,
};
use gantry_runtime::ContainerBackend;
use gantry_store::{append_dir_sorted, CompiledStore};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const ENTRYPOINT: &str = include_str!("../assets/run.sh");

/// Compute each selected group's dev version, in selection order.
pub fn role_dev_versions(
    groups: &[&InstanceGroup],
    opinions: Option<&Opinions>,
    settings: &ExportSettings,
    manifest_dir: &Path,
) -> Result<Vec<(String, String)>, KubeError> {
    let mut versions = Vec::with_capacity(groups.len());
    for group in groups {
        let version = role_dev_version(
            group,
            opinions,
            &settings.tag_extra,
            &settings.tool_version,
            manifest_dir,
        )?;
        versions.push((group.name.clone(), version));
    }
    Ok(versions)
}

/// Prefix an image name with organization and registry when configured.
fn qualify(settings: &ExportSettings, name: String) -> String {
    let mut qualified = name;
    if !settings.organization.is_empty() {
        qualified = format!("{}/{qualified}", settings.organization);
    }
    if !settings.registry.is_empty() {
        qualified = format!("{}/{qualified}", settings.registry);
    }
    qualified
}

/// Name of one instance group's image, tagged by its dev version.
pub fn role_image_name(settings: &ExportSettings, group_name: &str, dev_version: &str) -> String {
    qualify(
        settings,
        format!("{}-{}:{dev_version}", settings.repository, kebab(group_name)),
    )
}

/// Every package the selected groups need, deduplicated by fingerprint and
/// sorted by name for deterministic layer content.
pub fn collect_packages(
    groups: &[&InstanceGroup],
    releases: &[Release],
) -> Vec<Arc<Package>> {
    let mut by_fingerprint: BTreeMap<String, Arc<Package>> = BTreeMap::new();
    for release in releases {
        for group in groups {
            for job_ref in &group.job_references {
                if job_ref.release != release.name {
                    continue;
                }
                let Some(job) = &job_ref.job else { continue };
                let mut pending: Vec<&str> =
                    job.packages.iter().map(|p| p.name.as_str()).collect();
                while let Some(name) = pending.pop() {
                    let Some(pkg) = release.lookup_package(name) else {
                        continue;
                    };
                    if by_fingerprint
                        .insert(pkg.fingerprint.clone(), pkg.clone())
                        .is_none()
                    {
                        pending.extend(pkg.dependencies.iter().map(|d| d.name.as_str()));
                    }
                }
            }
        }
    }
    let mut packages: Vec<Arc<Package>> = by_fingerprint.into_values().collect();
    packages.sort_by(|a, b| a.name.cmp(&b.name));
    packages
}

/// Builds the packages layer: one image whose filesystem is the union of
/// every compiled package the selected instance groups need, plus a JSON
/// manifest mapping fingerprints to their paths.
pub struct PackagesImageBuilder<'a> {
    pub settings: &'a ExportSettings,
    pub store: &'a CompiledStore,
    pub stemcell_image: String,
}

impl<'a> PackagesImageBuilder<'a> {
    /// `<repository>-role-packages:<hash>` where the hash aggregates the
    /// tool version and each selected group's dev version.
    pub fn image_name(&self, dev_versions: &[(String, String)]) -> String {
        let mut signatures = vec![self.settings.tool_version.clone()];
        signatures.extend(dev_versions.iter().map(|(_, v)| v.clone()));
        qualify(
            self.settings,
            format!(
                "{}-role-packages:{}",
                self.settings.repository,
                aggregate_signatures(signatures)
            ),
        )
    }

    /// Build context: a Dockerfile deriving from the stemcell plus every
    /// compiled package under `var/vcap/packages/<name>`, and the manifest
    /// at `var/vcap/packages/packages.json`.
    pub fn context_tar(
        &self,
        packages: &[Arc<Package>],
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, KubeError> {
        let mut ar = tar::Builder::new(Vec::new());
        ar.follow_symlinks(false);

        let mut label_lines = String::new();
        for (key, value) in labels {
            label_lines.push_str(&format!("LABEL \"{key}\"=\"{value}\"\n"));
        }
        let dockerfile = format!(
            "FROM {}\n{label_lines}ADD var /var/\n",
            self.stemcell_image
        );
        append_text(&mut ar, "Dockerfile", &dockerfile)?;

        let mut manifest: BTreeMap<&str, String> = BTreeMap::new();
        for pkg in packages {
            if !self.store.is_compiled(&pkg.name, &pkg.fingerprint)? {
                return Err(KubeError::PackageNotCompiled {
                    name: pkg.name.clone(),
                    fingerprint: pkg.fingerprint.clone(),
                });
            }
            let compiled = self.store.compiled_dir(&pkg.name, &pkg.fingerprint);
            append_dir_sorted(
                &mut ar,
                &compiled,
                &format!("var/vcap/packages/{}", pkg.name),
            )?;
            manifest.insert(
                pkg.fingerprint.as_str(),
                format!("/var/vcap/packages/{}", pkg.name),
            );
        }
        let manifest_json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| KubeError::Io(std::io::Error::other(e)))?;
        append_text(&mut ar, "var/vcap/packages/packages.json", &manifest_json)?;

        Ok(ar.into_inner().map_err(KubeError::Io)?)
    }

    /// Build (or reuse) the packages layer image. Returns its name.
    pub fn build(
        &self,
        backend: &dyn ContainerBackend,
        packages: &[Arc<Package>],
        dev_versions: &[(String, String)],
        labels: &BTreeMap<String, String>,
    ) -> Result<String, KubeError> {
        let image_name = self.image_name(dev_versions);
        if !self.settings.force && backend.has_image(&image_name)? {
            info!("packages layer {image_name} already exists, skipping");
            return Ok(image_name);
        }
        if self.settings.no_build {
            info!("skipping packages layer build (no-build)");
            return Ok(image_name);
        }
        let context = self.context_tar(packages, labels)?;
        backend.build_image(&image_name, labels, &context)?;
        Ok(image_name)
    }

    /// Write the build context as a tar file instead of building an image.
    pub fn write_tarball(
        &self,
        packages: &[Arc<Package>],
        dev_versions: &[(String, String)],
        labels: &BTreeMap<String, String>,
        output_dir: &Path,
    ) -> Result<PathBuf, KubeError> {
        let image_name = self.image_name(dev_versions);
        let file_name = gantry_runtime::sanitize_name(&image_name);
        let output = output_dir.join(format!("{file_name}.tar"));
        std::fs::create_dir_all(output_dir)?;
        let context = self.context_tar(packages, labels)?;
        std::fs::write(&output, context)?;
        Ok(output)
    }
}

/// Builds one image per instance group, derived from the packages layer,
/// injecting job templates, scripts, and the standard entrypoint.
pub struct RoleImageBuilder<'a> {
    pub settings: &'a ExportSettings,
    /// Name of the packages layer image to derive from.
    pub base_image: String,
    pub manifest_dir: PathBuf,
}

impl<'a> RoleImageBuilder<'a> {
    pub fn dockerfile(&self, group: &InstanceGroup) -> String {
        format!(
            concat!(
                "FROM {base}\n",
                "LABEL \"instance_group\"=\"{name}\"\n",
                "ADD root /\n",
                "ENTRYPOINT [\"/opt/gantry/run.sh\"]\n",
            ),
            base = self.base_image,
            name = group.name,
        )
    }

    /// Build context for one group: Dockerfile, entrypoint, the group's
    /// scripts, and each job's templates under its jobs-src tree.
    pub fn context_tar(&self, group: &InstanceGroup) -> Result<Vec<u8>, KubeError> {
        let mut ar = tar::Builder::new(Vec::new());
        ar.follow_symlinks(false);

        append_text(&mut ar, "Dockerfile", &self.dockerfile(group))?;
        append_text(&mut ar, "root/opt/gantry/run.sh", ENTRYPOINT)?;

        for (script, path) in group.script_paths(&self.manifest_dir) {
            let content = std::fs::read_to_string(&path)?;
            append_text(
                &mut ar,
                &format!("root/opt/gantry/startup/{script}"),
                &content,
            )?;
        }

        for job_ref in &group.job_references {
            let Some(job) = &job_ref.job else { continue };
            for template in &job.templates {
                append_text(
                    &mut ar,
                    &format!(
                        "root/var/vcap/jobs-src/{}/templates/{}",
                        job.name, template.source_path
                    ),
                    &template.content,
                )?;
            }
        }

        Ok(ar.into_inner().map_err(KubeError::Io)?)
    }

    /// Build (or reuse) the group's image. Returns its name.
    pub fn build(
        &self,
        backend: &dyn ContainerBackend,
        group: &InstanceGroup,
        dev_version: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String, KubeError> {
        let image_name = role_image_name(self.settings, &group.name, dev_version);
        if !self.settings.force && backend.has_image(&image_name)? {
            info!("role image {image_name} already exists, skipping");
            return Ok(image_name);
        }
        if self.settings.no_build {
            info!("skipping role image build for {} (no-build)", group.name);
            return Ok(image_name);
        }
        let context = self.context_tar(group)?;
        backend.build_image(&image_name, labels, &context)?;
        Ok(image_name)
    }
}

fn append_text<W: std::io::Write>(
    ar: &mut tar::Builder<W>,
    path: &str,
    content: &str,
) -> Result<(), KubeError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(if path.ends_with(".sh") { 0o755 } else { 0o644 });
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    ar.append_data(&mut header, path, content.as_bytes())
        .map_err(KubeError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_model::fixtures::ReleaseBuilder;
    use gantry_model::{resolve, RoleManifest};
    use gantry_runtime::MockBackend;

    fn settings() -> ExportSettings {
        ExportSettings {
            repository: "gantry".to_owned(),
            tool_version: "0.9.0".to_owned(),
            ..ExportSettings::default()
        }
    }

    fn fixture(dir: &Path) -> (RoleManifest, Vec<Release>) {
        let release = ReleaseBuilder::new("demo", "1")
            .package("base", &[])
            .package("app", &["base"])
            .job("svc", &["app"])
            .build(dir)
            .unwrap();
        let mut manifest = RoleManifest::parse(
            r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: api
  jobs:
  - name: svc
    release: demo
    properties:
      bosh_containerization:
        run:
          scaling: {min: 1, max: 1}
"#,
            &dir.join("role-manifest.yml"),
        )
        .unwrap();
        let releases = vec![release];
        resolve(&mut manifest, &releases).unwrap();
        (manifest, releases)
    }

    fn compile_all(store: &CompiledStore, releases: &[Release]) {
        for pkg in &releases[0].packages {
            let dir = store.compiled_dir(&pkg.name, &pkg.fingerprint);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("bin"), pkg.name.as_bytes()).unwrap();
        }
    }

    #[test]
    fn packages_layer_contains_all_packages_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, releases) = fixture(dir.path());
        let groups: Vec<&InstanceGroup> = manifest.instance_groups.iter().collect();
        let store = CompiledStore::new(dir.path().join("compilation"));
        compile_all(&store, &releases);

        let settings = settings();
        let builder = PackagesImageBuilder {
            settings: &settings,
            store: &store,
            stemcell_image: "stemcell:latest".to_owned(),
        };
        let packages = collect_packages(&groups, &releases);
        assert_eq!(packages.len(), 2);

        let tar_bytes = builder
            .context_tar(&packages, &BTreeMap::new())
            .unwrap();
        let mut names = Vec::new();
        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        for entry in archive.entries().unwrap() {
            names.push(
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .to_string(),
            );
        }
        assert!(names.contains(&"Dockerfile".to_owned()));
        assert!(names.contains(&"var/vcap/packages/app/bin".to_owned()));
        assert!(names.contains(&"var/vcap/packages/base/bin".to_owned()));
        assert!(names.contains(&"var/vcap/packages/packages.json".to_owned()));
    }

    #[test]
    fn missing_compiled_package_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, releases) = fixture(dir.path());
        let groups: Vec<&InstanceGroup> = manifest.instance_groups.iter().collect();
        let store = CompiledStore::new(dir.path().join("compilation"));

        let settings = settings();
        let builder = PackagesImageBuilder {
            settings: &settings,
            store: &store,
            stemcell_image: "stemcell:latest".to_owned(),
        };
        let packages = collect_packages(&groups, &releases);
        let err = builder
            .context_tar(&packages, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, KubeError::PackageNotCompiled { .. }));
    }

    #[test]
    fn image_names_are_deterministic_and_qualified() {
        let mut settings = settings();
        let dev_versions = vec![("api".to_owned(), "abc123".to_owned())];
        let store = CompiledStore::new("/tmp/unused");
        let builder = PackagesImageBuilder {
            settings: &settings,
            store: &store,
            stemcell_image: "stemcell:latest".to_owned(),
        };
        let n1 = builder.image_name(&dev_versions);
        let n2 = builder.image_name(&dev_versions);
        assert_eq!(n1, n2);
        assert!(n1.starts_with("gantry-role-packages:"));

        settings.registry = "registry.example.com".to_owned();
        settings.organization = "cloud".to_owned();
        let name = role_image_name(&settings, "My_API", "v1");
        assert_eq!(name, "registry.example.com/cloud/gantry-my-api:v1");
    }

    #[test]
    fn existing_image_is_reused_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let (manifest, releases) = fixture(dir.path());
        let groups: Vec<&InstanceGroup> = manifest.instance_groups.iter().collect();
        let store = CompiledStore::new(dir.path().join("compilation"));
        compile_all(&store, &releases);

        let mut settings = settings();
        let backend = MockBackend::new();
        let packages = collect_packages(&groups, &releases);
        let dev_versions = vec![("api".to_owned(), "v1".to_owned())];

        let builder = PackagesImageBuilder {
            settings: &settings,
            store: &store,
            stemcell_image: "stemcell:latest".to_owned(),
        };
        let name = builder
            .build(&backend, &packages, &dev_versions, &BTreeMap::new())
            .unwrap();
        assert_eq!(backend.built_images().len(), 1);

        // second build reuses
        builder
            .build(&backend, &packages, &dev_versions, &BTreeMap::new())
            .unwrap();
        assert_eq!(backend.built_images().len(), 1);

        // force rebuilds
        settings.force = true;
        let builder = PackagesImageBuilder {
            settings: &settings,
            store: &store,
            stemcell_image: "stemcell:latest".to_owned(),
        };
        let name2 = builder
            .build(&backend, &packages, &dev_versions, &BTreeMap::new())
            .unwrap();
        assert_eq!(name, name2);
        assert_eq!(backend.built_images().len(), 2);
    }

    #[test]
    fn role_image_context_carries_templates_and_entrypoint() {
        let dir = tempfile::tempdir().unwrap();
        let release = ReleaseBuilder::new("demo", "1")
            .job_from_mf(
                r#"
name: svc
templates:
  ctl.erb: bin/ctl
"#,
                &[("ctl.erb", "#!/bin/sh\nexec svc\n")],
            )
            .build(dir.path())
            .unwrap();
        let mut manifest = RoleManifest::parse(
            r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: api
  jobs:
  - name: svc
    release: demo
    properties:
      bosh_containerization:
        run:
          scaling: {min: 1, max: 1}
"#,
            &dir.path().join("role-manifest.yml"),
        )
        .unwrap();
        let releases = vec![release];
        resolve(&mut manifest, &releases).unwrap();

        let settings = settings();
        let builder = RoleImageBuilder {
            settings: &settings,
            base_image: "gantry-role-packages:abc".to_owned(),
            manifest_dir: dir.path().to_path_buf(),
        };
        let group = &manifest.instance_groups[0];
        let context = builder.context_tar(group).unwrap();

        let mut found = Vec::new();
        let mut archive = tar::Archive::new(context.as_slice());
        for entry in archive.entries().unwrap() {
            found.push(
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .to_string(),
            );
        }
        assert!(found.contains(&"root/opt/gantry/run.sh".to_owned()));
        assert!(found.contains(&"root/var/vcap/jobs-src/svc/templates/ctl.erb".to_owned()));

        let dockerfile = builder.dockerfile(group);
        assert!(dockerfile.starts_with("FROM gantry-role-packages:abc"));
        assert!(dockerfile.contains("ENTRYPOINT"));
    }
}
