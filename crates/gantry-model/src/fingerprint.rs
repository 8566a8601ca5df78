use crate::manifest::InstanceGroup;
use crate::opinions::{flatten, properties_for_job, Opinions};
use crate::package::PackageRef;
use crate::ModelError;
use sha1::{Digest, Sha1};
use std::path::Path;

/// SHA-1 over a sequence of signatures, each terminated by a NUL byte, with
/// the decimal total input length hashed last.
///
/// The separator alone is not enough: `["ab", "a"]` and `["a", "ba"]` would
/// collide without the trailing length, which makes the function injective
/// over the input sequence.
pub fn aggregate_signatures<I, S>(signatures: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha1::new();
    let mut length: usize = 0;
    for signature in signatures {
        let s = signature.as_ref();
        hasher.update(s.as_bytes());
        hasher.update(b"\x00");
        length += s.len();
    }
    hasher.update(length.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-1 over the group's script file names and contents, sorted by name.
fn script_signature(group: &InstanceGroup, manifest_dir: &Path) -> Result<String, ModelError> {
    let mut hasher = Sha1::new();
    // BTreeMap iteration is already sorted by script name.
    for (name, path) in group.script_paths(manifest_dir) {
        hasher.update(name.as_bytes());
        hasher.update(&std::fs::read(&path)?);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-1 over the group's configuration templates as sorted `key: value`
/// lines.
fn template_signature(group: &InstanceGroup) -> String {
    let mut lines: Vec<String> = group
        .resolved_templates
        .iter()
        .map(|(key, def)| format!("{key}: {}", def.value))
        .collect();
    lines.sort();

    let mut hasher = Sha1::new();
    for line in &lines {
        hasher.update(line.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Signature of everything that goes into an instance group's image apart
/// from opinions: job archives in manifest order (order matters for task
/// groups), dependency packages sorted by name, scripts, and templates.
pub fn role_job_and_packages_signature(
    group: &InstanceGroup,
    manifest_dir: &Path,
) -> Result<String, ModelError> {
    let mut role_signature = String::new();
    let mut packages: Vec<&PackageRef> = Vec::new();

    // Job references are *not* sorted; the manifest order is significant.
    for job_ref in &group.job_references {
        let Some(job) = &job_ref.job else { continue };
        role_signature.push('\n');
        role_signature.push_str(&job.sha1);
        packages.extend(job.packages.iter());
    }

    packages.sort_by(|a, b| a.name.cmp(&b.name));
    for pkg in packages {
        role_signature.push('\n');
        role_signature.push_str(&pkg.sha1);
    }

    role_signature.push('\n');
    role_signature.push_str(&script_signature(group, manifest_dir)?);

    if !group.resolved_templates.is_empty() {
        role_signature.push('\n');
        role_signature.push_str(&template_signature(group));
    }

    Ok(sha1_hex(role_signature.as_bytes()))
}

/// The version hash for an instance group's image.
///
/// Aggregates the job-and-package signature, the tool version, the extra
/// tag, and each job's flattened opinionated properties in manifest job
/// order. A property used by several jobs is hashed once per job; the
/// duplication is intentional, keeping each job's contribution independent.
pub fn role_dev_version(
    group: &InstanceGroup,
    opinions: Option<&Opinions>,
    tag_extra: &str,
    tool_version: &str,
    manifest_dir: &Path,
) -> Result<String, ModelError> {
    let job_pkg_version = role_job_and_packages_signature(group, manifest_dir)?;

    let mut signatures = vec![
        job_pkg_version,
        tool_version.to_owned(),
        tag_extra.to_owned(),
    ];

    if let Some(opinions) = opinions {
        for job_ref in &group.job_references {
            let Some(job) = &job_ref.job else { continue };
            let props = properties_for_job(job, opinions)?;
            // flatten() returns a BTreeMap, so keys come out sorted.
            for (key, value) in flatten(&props) {
                signatures.push(key);
                signatures.push(value);
            }
        }
    }

    Ok(aggregate_signatures(signatures))
}
