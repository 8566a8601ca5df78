//! Five-stage resolution of a role manifest against its loaded releases.
//!
//! Stages: structural validation, run aggregation, authorization accounting,
//! link resolution, global validation. Diagnostics accumulate per stage so a
//! user sees every problem at once; given the same `(manifest, releases)`
//! pair the resolver produces identical diagnostics in the same order.

use crate::job::LinkInfo;
use crate::manifest::{
    Authorization, GroupTag, GroupType, InstanceGroup, RoleManifest, TemplateDef, Variable,
};
use crate::opinions::scalar_to_string;
use crate::release::Release;
use crate::run::RoleRun;
use crate::validation::{ErrorList, ValidationError};
use crate::ModelError;
use std::collections::{BTreeMap, BTreeSet};

/// Variable kinds a manifest may declare.
const VARIABLE_KINDS: [&str; 5] = ["", "certificate", "password", "rsa", "ssh"];

/// Resolve the manifest in place. On success the instance groups carry
/// aggregated `run` blocks, bound jobs, resolved link endpoints, and
/// resolved configuration templates.
pub fn resolve(manifest: &mut RoleManifest, releases: &[Release]) -> Result<(), ModelError> {
    let releases_by_name = map_releases(releases)?;
    let mut errs = ErrorList::new();

    // Stage 1 + 2: structural checks and run aggregation, per group.
    let mut feature_registrations: Vec<(String, bool)> = Vec::new();
    for group in &mut manifest.instance_groups {
        validate_group_type(group, &mut errs);
        validate_feature_guards(group, &mut errs);
        validate_tags(group, &mut errs);
        errs.extend(calculate_role_run(group));

        if !group.default_feature.is_empty() {
            feature_registrations.push((group.default_feature.clone(), true));
        }
        for feature in [&group.if_feature, &group.unless_feature] {
            if !feature.is_empty() {
                feature_registrations.push((feature.clone(), false));
            }
        }
    }
    for (feature, enabled_by_default) in feature_registrations {
        manifest.features.entry(feature).or_insert(enabled_by_default);
    }

    // Stage 3: authorization accounting.
    let authorization = &mut manifest.configuration.authorization;
    for group in &manifest.instance_groups {
        account_for_authorization(authorization, group);
    }

    if !errs.is_empty() {
        return Err(ModelError::Validation(errs));
    }

    // Bind job references to release jobs.
    for group in &mut manifest.instance_groups {
        errs.extend(bind_job_references(group, &releases_by_name));
    }

    // Skip link resolution and global validation if any job failed to bind;
    // those routines assume valid jobs.
    if !errs.is_empty() {
        return Err(ModelError::Validation(errs));
    }

    calculate_configuration_templates(manifest);

    errs.extend(resolve_links(manifest));
    errs.extend(validate_variable_kinds(&manifest.variables));
    errs.extend(validate_variable_previous_names(&manifest.variables));
    errs.extend(validate_variable_descriptions(&manifest.variables));
    errs.extend(validate_service_accounts(manifest));
    errs.extend(validate_colocated_container_references(manifest));
    errs.extend(validate_colocated_port_collisions(manifest));
    errs.extend(validate_colocated_volume_shares(manifest));
    errs.extend(validate_template_usage(manifest));

    errs.into_result().map_err(ModelError::Validation)
}

fn map_releases<'a>(
    releases: &'a [Release],
) -> Result<BTreeMap<&'a str, &'a Release>, ModelError> {
    let mut map = BTreeMap::new();
    for release in releases {
        if map.insert(release.name.as_str(), release).is_some() {
            return Err(ModelError::DuplicateRelease(release.name.clone()));
        }
    }
    Ok(map)
}

fn validate_group_type(group: &mut InstanceGroup, errs: &mut ErrorList) {
    if group.group_type.is_empty() {
        group.group_type = GroupType::Bosh.as_str().to_owned();
        return;
    }
    if GroupType::parse(&group.group_type).is_none() {
        errs.push(ValidationError::invalid(
            format!("instance_groups[{}].type", group.name),
            &group.group_type,
            "Expected one of bosh, bosh-task, or colocated-container",
        ));
    }
}

fn validate_feature_guards(group: &InstanceGroup, errs: &mut ErrorList) {
    let default_set = !group.default_feature.is_empty();
    let if_set = !group.if_feature.is_empty();
    let unless_set = !group.unless_feature.is_empty();
    if (default_set && (if_set || unless_set)) || (if_set && unless_set) {
        errs.push(ValidationError::forbidden(
            format!("instance_groups[{}]", group.name),
            &format!(
                "default_feature[{}], if_feature[{}], and unless_feature[{}] are all mutually exclusive",
                group.default_feature, group.if_feature, group.unless_feature
            ),
        ));
    }
}

fn validate_tags(group: &InstanceGroup, errs: &mut ErrorList) {
    for tag in &group.tags {
        if GroupTag::parse(tag).is_none() {
            errs.push(ValidationError::invalid(
                format!("instance_groups[{}].tags", group.name),
                tag,
                "Unknown tag",
            ));
        }
    }
}

/// Fold the job references' run blocks onto the instance group.
pub fn calculate_role_run(group: &mut InstanceGroup) -> ErrorList {
    let mut errs = ErrorList::new();
    let path = format!("instance_groups[{}]", group.name);

    let runs: Vec<&RoleRun> = group
        .job_references
        .iter()
        .filter_map(|j| j.properties.bosh_containerization.run.as_ref())
        .collect();
    if runs.is_empty() {
        group.run = Some(RoleRun::default());
        errs.push(ValidationError::required(
            path,
            "`properties.bosh_containerization.run` required for at least one job",
        ));
        return errs;
    }

    let mut run = RoleRun::default();

    // Flight stage must agree across every job that sets it.
    let stages: BTreeSet<&str> = runs
        .iter()
        .map(|r| r.flight_stage.as_str())
        .filter(|s| !s.is_empty())
        .collect();
    if stages.len() > 1 {
        errs.push(ValidationError::invalid(
            path.clone(),
            &stages.iter().copied().collect::<Vec<_>>().join(", "),
            "If multiple jobs of an instance group specify flight-stage, the values must agree",
        ));
    } else if let Some(stage) = stages.into_iter().next() {
        run.flight_stage = stage.to_owned();
    }

    // First job that defines scaling wins.
    run.scaling = runs.iter().find_map(|r| r.scaling.clone());

    // Capabilities are a set union.
    let mut capabilities: BTreeSet<String> = BTreeSet::new();
    for r in &runs {
        capabilities.extend(r.capabilities.iter().cloned());
    }
    run.capabilities = capabilities.into_iter().collect();

    // Volumes are united by tag; the same tag must mean the same path.
    for r in &runs {
        for volume in &r.volumes {
            if volume.tag.is_empty() {
                run.volumes.push(volume.clone());
                continue;
            }
            match run.volumes.iter().find(|v| v.tag == volume.tag) {
                None => run.volumes.push(volume.clone()),
                Some(existing) if existing.path != volume.path => {
                    errs.push(ValidationError::invalid(
                        path.clone(),
                        &volume.tag,
                        &format!(
                            "Volume tag used with conflicting paths {} and {}",
                            existing.path, volume.path
                        ),
                    ));
                }
                Some(_) => {}
            }
        }
    }

    // Resource fields take the maximum across jobs.
    for r in &runs {
        if let Some(memory) = &r.memory {
            let target = run.memory.get_or_insert_with(Default::default);
            target.request = max_option(target.request, memory.request);
            target.limit = max_option(target.limit, memory.limit);
        }
        if let Some(cpu) = &r.cpu {
            let target = run.cpu.get_or_insert_with(Default::default);
            target.request = max_option_f64(target.request, cpu.request);
            target.limit = max_option_f64(target.limit, cpu.limit);
        }
    }

    // At most one job may declare a health check.
    let healthchecked: Vec<&&RoleRun> =
        runs.iter().filter(|r| r.healthcheck.is_some()).collect();
    if healthchecked.len() > 1 {
        errs.push(ValidationError::invalid(
            path.clone(),
            "healthcheck",
            "Cannot specify healthcheck properties on more than one job of the same instance group",
        ));
    } else if let Some(r) = healthchecked.first() {
        run.healthcheck.clone_from(&r.healthcheck);
    }

    // Probe and service account must be a single distinct value.
    match unique_string(&runs, |r| &r.active_passive_probe) {
        Ok(value) => run.active_passive_probe = value,
        Err(()) => errs.push(ValidationError::invalid(
            path.clone(),
            "active-passive-probe",
            "Cannot specify distinct active-passive-probe values across jobs of the same instance group",
        )),
    }
    match unique_string(&runs, |r| &r.service_account) {
        Ok(value) => run.service_account = value,
        Err(()) => errs.push(ValidationError::invalid(
            path.clone(),
            "service-account",
            "Cannot specify distinct service-account values across jobs of the same instance group",
        )),
    }

    // At most one job may declare affinity.
    let affinities: Vec<&&RoleRun> = runs.iter().filter(|r| r.affinity.is_some()).collect();
    if affinities.len() > 1 {
        errs.push(ValidationError::invalid(
            path.clone(),
            "affinity",
            "Cannot specify affinity on more than one job of the same instance group",
        ));
    } else if let Some(r) = affinities.first() {
        run.affinity.clone_from(&r.affinity);
    }

    group.run = Some(run);
    errs
}

fn max_option(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn max_option_f64(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// A non-empty string that must be the same wherever it is set.
fn unique_string<'a>(
    runs: &[&'a RoleRun],
    select: impl Fn(&'a RoleRun) -> &'a str,
) -> Result<String, ()> {
    let values: BTreeSet<&str> = runs
        .iter()
        .map(|&r| select(r))
        .filter(|s| !s.is_empty())
        .collect();
    match values.len() {
        0 => Ok(String::new()),
        1 => Ok(values.into_iter().next().unwrap_or_default().to_owned()),
        _ => Err(()),
    }
}

fn account_for_authorization(authorization: &mut Authorization, group: &InstanceGroup) {
    let account_name = group
        .run
        .as_ref()
        .map(|r| r.service_account.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("default")
        .to_owned();

    let roles;
    let cluster_roles;
    {
        let account = authorization.accounts.entry(account_name.clone()).or_default();
        account.used_by.insert(group.name.clone());
        roles = account.roles.clone();
        cluster_roles = account.cluster_roles.clone();
    }
    for role in roles {
        authorization
            .role_used_by
            .entry(role)
            .or_default()
            .insert(account_name.clone());
    }
    for cluster_role in cluster_roles {
        authorization
            .cluster_role_used_by
            .entry(cluster_role)
            .or_default()
            .insert(account_name.clone());
    }
}

fn bind_job_references(
    group: &mut InstanceGroup,
    releases: &BTreeMap<&str, &Release>,
) -> ErrorList {
    let mut errs = ErrorList::new();
    for job_ref in &mut group.job_references {
        let path = format!("instance_groups[{}].jobs[{}]", group.name, job_ref.name);
        if job_ref.release.is_empty() {
            errs.push(ValidationError::required(path, "Job reference has no release"));
            continue;
        }
        let Some(release) = releases.get(job_ref.release.as_str()) else {
            errs.push(ValidationError::not_found(
                path,
                &format!("Referenced release {} is not loaded", job_ref.release),
            ));
            continue;
        };
        match release.lookup_job(&job_ref.name) {
            Some(job) => job_ref.job = Some(job.clone()),
            None => errs.push(ValidationError::not_found(
                path,
                &format!(
                    "Job {} not found in release {}",
                    job_ref.name, job_ref.release
                ),
            )),
        }
    }
    errs
}

/// Compute each group's effective templates (own plus non-overridden
/// globals), then the manifest-wide union used for validation.
fn calculate_configuration_templates(manifest: &mut RoleManifest) {
    let global: BTreeMap<String, String> = manifest
        .configuration
        .templates
        .iter()
        .map(|(k, v)| (k.clone(), scalar_to_string(v)))
        .collect();

    for group in &mut manifest.instance_groups {
        let mut resolved = BTreeMap::new();
        if let Some(config) = &group.configuration {
            for (key, value) in &config.templates {
                resolved.insert(
                    key.clone(),
                    TemplateDef {
                        value: scalar_to_string(value),
                        is_global: false,
                    },
                );
            }
        }
        for (key, value) in &global {
            resolved.entry(key.clone()).or_insert_with(|| TemplateDef {
                value: value.clone(),
                is_global: true,
            });
        }
        group.resolved_templates = resolved;
    }

    let mut union: BTreeMap<String, TemplateDef> = BTreeMap::new();
    for group in &manifest.instance_groups {
        for (key, def) in &group.resolved_templates {
            match union.get(key) {
                Some(_) if !def.is_global => {
                    union.insert(key.clone(), def.clone());
                }
                Some(_) => {}
                None => {
                    union.insert(key.clone(), def.clone());
                }
            }
        }
    }
    manifest.configuration.resolved_templates = union;
}

/// Lowercase a name and turn underscores into dashes, yielding the form used
/// in service names.
pub fn kebab(name: &str) -> String {
    name.to_lowercase().replace('_', "-")
}

#[derive(Debug, Clone)]
struct ResolvedProvider {
    info: LinkInfo,
    #[allow(dead_code)]
    properties: Vec<String>,
}

/// Wire provider/consumer links across the deployment.
///
/// Pass A indexes providers: by export name (the role-manifest alias when
/// present, the declared name otherwise) and by type (every provider of
/// every job). Pass B resolves each job's consumers: explicit manifest
/// overrides first, then declared consumers by name, then by unique type.
/// Bound providers learn who consumes them (`resolved_consumed_by`).
pub fn resolve_links(manifest: &mut RoleManifest) -> ErrorList {
    let mut errs = ErrorList::new();

    // Pass A: provider indices.
    let mut providers_by_name: BTreeMap<String, ResolvedProvider> = BTreeMap::new();
    let mut providers_by_type: BTreeMap<String, Vec<ResolvedProvider>> = BTreeMap::new();

    for group in &manifest.instance_groups {
        for job_ref in &group.job_references {
            let Some(job) = &job_ref.job else { continue };
            let service_name = {
                let explicit = &job_ref.properties.bosh_containerization.service_name;
                if explicit.is_empty() {
                    format!("{}-{}", kebab(&group.name), kebab(&job_ref.name))
                } else {
                    explicit.clone()
                }
            };

            for provider in job.available_providers.values() {
                providers_by_type
                    .entry(provider.link_type.clone())
                    .or_default()
                    .push(ResolvedProvider {
                        info: LinkInfo {
                            name: provider.name.clone(),
                            link_type: provider.link_type.clone(),
                            role_name: group.name.clone(),
                            job_name: job_ref.name.clone(),
                            service_name: service_name.clone(),
                        },
                        properties: provider.properties.clone(),
                    });
            }

            for (name, exported) in &job_ref.provides {
                let Some(provider) = job.available_providers.get(name) else {
                    let available: Vec<&String> = job.available_providers.keys().collect();
                    errs.push(ValidationError::not_found(
                        format!(
                            "instance_groups[{}].jobs[{}].provides[{}]",
                            group.name, job_ref.name, name
                        ),
                        &format!("Provider not found; available providers: {available:?}"),
                    ));
                    continue;
                };
                let export_name = if exported.alias.is_empty() {
                    name.clone()
                } else {
                    exported.alias.clone()
                };
                providers_by_name.insert(
                    export_name,
                    ResolvedProvider {
                        info: LinkInfo {
                            name: provider.name.clone(),
                            link_type: provider.link_type.clone(),
                            role_name: group.name.clone(),
                            job_name: job_ref.name.clone(),
                            service_name: service_name.clone(),
                        },
                        properties: provider.properties.clone(),
                    },
                );
            }
        }
    }

    // Pass B: consumer resolution.
    for group_index in 0..manifest.instance_groups.len() {
        let group_name = manifest.instance_groups[group_index].name.clone();
        for job_index in 0..manifest.instance_groups[group_index].job_references.len() {
            let job_ref = &mut manifest.instance_groups[group_index].job_references[job_index];
            let Some(job) = job_ref.job.clone() else { continue };

            let mut expected = job.desired_consumers.clone();

            // Explicitly overridden consumers first.
            let overrides: Vec<(String, crate::manifest::ConsumeOverride)> = job_ref
                .consumes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for (consumer_name, consumer_override) in overrides {
                let alias = if consumer_override.alias.is_empty() {
                    consumer_name.clone()
                } else {
                    consumer_override.alias.clone()
                };
                if alias.is_empty() {
                    errs.push(ValidationError::invalid(
                        format!("instance_group[{}].job[{}]", group_name, job_ref.name),
                        "name",
                        "consumer has no name",
                    ));
                    continue;
                }
                match providers_by_name.get(&alias) {
                    None => errs.push(ValidationError::not_found(
                        format!(
                            "instance_group[{}].job[{}].consumes[{}]",
                            group_name, job_ref.name, consumer_name
                        ),
                        &format!("consumer {alias} not found"),
                    )),
                    Some(provider) => {
                        if consumer_override.ignore {
                            job_ref.resolved_consumes.remove(&consumer_name);
                        } else {
                            job_ref
                                .resolved_consumes
                                .insert(consumer_name.clone(), provider.info.clone());
                        }
                    }
                }
                expected.retain(|c| c.name != consumer_name);
            }

            // Remaining declared consumers: by published name, or by being
            // the unique provider of the wanted type in the deployment.
            for consumer in expected {
                let mut provider = None;
                if !consumer.name.is_empty() {
                    provider = providers_by_name.get(&consumer.name);
                }
                if provider.is_none() {
                    if let Some(candidates) = providers_by_type.get(&consumer.link_type) {
                        if candidates.len() == 1 {
                            provider = candidates.first();
                        }
                    }
                }
                match provider {
                    Some(p) => {
                        let key = if consumer.name.is_empty() {
                            p.info.name.clone()
                        } else {
                            consumer.name.clone()
                        };
                        job_ref.resolved_consumes.insert(key, p.info.clone());
                    }
                    None if !consumer.optional => {
                        errs.push(ValidationError::required(
                            format!(
                                "instance_group[{}].job[{}].consumes[{}]",
                                group_name, job_ref.name, consumer.name
                            ),
                            &format!(
                                "failed to resolve provider {} (type {})",
                                consumer.name, consumer.link_type
                            ),
                        ));
                    }
                    None => {}
                }
            }
        }
    }

    errs.extend(record_job_consumers(manifest));
    errs
}

/// Record, on every bound provider, the consumers pointing at it.
fn record_job_consumers(manifest: &mut RoleManifest) -> ErrorList {
    let mut errs = ErrorList::new();
    let mut back_edges: Vec<(String, String, String, LinkInfo)> = Vec::new();

    for group in &manifest.instance_groups {
        for job_ref in &group.job_references {
            for (link_name, consumer) in &job_ref.resolved_consumes {
                let path = format!(
                    "instance_group[{}].job[{}].consumes[{}]",
                    group.name, job_ref.name, link_name
                );
                let Some(provider_group) = manifest.lookup_instance_group(&consumer.role_name)
                else {
                    // We resolved this link, yet the instance group that
                    // provides it cannot be found again: a resolver bug.
                    errs.push(ValidationError::internal(
                        path,
                        &format!(
                            "Could not find resolved instance group {}",
                            consumer.role_name
                        ),
                    ));
                    continue;
                };
                if provider_group.lookup_job(&consumer.job_name).is_none() {
                    errs.push(ValidationError::internal(
                        path,
                        &format!(
                            "Could not find resolved job {} in instance group {}",
                            consumer.job_name, consumer.role_name
                        ),
                    ));
                    continue;
                }
                back_edges.push((
                    consumer.role_name.clone(),
                    consumer.job_name.clone(),
                    link_name.clone(),
                    LinkInfo {
                        name: consumer.name.clone(),
                        link_type: consumer.link_type.clone(),
                        role_name: group.name.clone(),
                        job_name: job_ref.name.clone(),
                        service_name: consumer.service_name.clone(),
                    },
                ));
            }
        }
    }

    for (provider_role, provider_job, link_name, info) in back_edges {
        if let Some(group) = manifest
            .instance_groups
            .iter_mut()
            .find(|g| g.name == provider_role)
        {
            if let Some(job_ref) = group
                .job_references
                .iter_mut()
                .find(|j| j.name == provider_job)
            {
                job_ref
                    .resolved_consumed_by
                    .entry(link_name)
                    .or_default()
                    .push(info);
            }
        }
    }

    errs
}

fn validate_variable_kinds(variables: &[Variable]) -> ErrorList {
    let mut errs = ErrorList::new();
    for variable in variables {
        if !VARIABLE_KINDS.contains(&variable.options.kind.as_str()) {
            errs.push(ValidationError::invalid(
                format!("variables[{}].type", variable.name),
                &variable.options.kind,
                "Expected one of certificate, password, rsa, or ssh",
            ));
        }
    }
    errs
}

fn validate_variable_previous_names(variables: &[Variable]) -> ErrorList {
    let mut errs = ErrorList::new();
    let declared: BTreeSet<&str> = variables.iter().map(|v| v.name.as_str()).collect();
    let mut seen_previous: BTreeMap<&str, &str> = BTreeMap::new();
    for variable in variables {
        for previous in &variable.options.previous_names {
            if declared.contains(previous.as_str()) {
                errs.push(ValidationError::invalid(
                    format!("variables[{}].previous_names", variable.name),
                    previous,
                    "Previous name clashes with a declared variable",
                ));
            }
            if let Some(other) = seen_previous.insert(previous, &variable.name) {
                errs.push(ValidationError::invalid(
                    format!("variables[{}].previous_names", variable.name),
                    previous,
                    &format!("Previous name is already claimed by variable {other}"),
                ));
            }
        }
    }
    errs
}

fn validate_variable_descriptions(variables: &[Variable]) -> ErrorList {
    let mut errs = ErrorList::new();
    for variable in variables {
        if variable.options.description.is_empty() {
            errs.push(ValidationError::required(
                format!("variables[{}].description", variable.name),
                "Description is required",
            ));
        }
    }
    errs
}

fn validate_service_accounts(manifest: &RoleManifest) -> ErrorList {
    let mut errs = ErrorList::new();
    let authorization = &manifest.configuration.authorization;
    for (account_name, account) in &authorization.accounts {
        for role in &account.roles {
            if !authorization.roles.contains_key(role) {
                errs.push(ValidationError::not_found(
                    format!(
                        "configuration.authorization.accounts[{account_name}].roles[{role}]"
                    ),
                    &format!("Undefined role {role}"),
                ));
            }
        }
        for cluster_role in &account.cluster_roles {
            if !authorization.cluster_roles.contains_key(cluster_role) {
                errs.push(ValidationError::not_found(
                    format!(
                        "configuration.authorization.accounts[{account_name}].cluster-roles[{cluster_role}]"
                    ),
                    &format!("Undefined cluster role {cluster_role}"),
                ));
            }
        }
    }
    errs
}

fn validate_colocated_container_references(manifest: &RoleManifest) -> ErrorList {
    let mut errs = ErrorList::new();
    let mut used: BTreeSet<&str> = BTreeSet::new();

    for group in &manifest.instance_groups {
        for name in group.colocated_containers() {
            used.insert(name);
            match manifest.lookup_instance_group(name) {
                None => errs.push(ValidationError::not_found(
                    format!("instance_groups[{}].colocated_containers", group.name),
                    &format!("Unknown colocated container {name}"),
                )),
                Some(target) if !target.is_colocated() => {
                    errs.push(ValidationError::invalid(
                        format!("instance_groups[{}].colocated_containers", group.name),
                        name,
                        "Referenced instance group is not of type colocated-container",
                    ));
                }
                Some(_) => {}
            }
        }
    }

    for group in &manifest.instance_groups {
        if group.is_colocated() && !used.contains(group.name.as_str()) {
            errs.push(ValidationError::invalid(
                format!("instance_groups[{}]", group.name),
                &group.name,
                "instance group of type colocated-container is not used by any other instance group",
            ));
        }
    }
    errs
}

fn validate_colocated_port_collisions(manifest: &RoleManifest) -> ErrorList {
    let mut errs = ErrorList::new();
    for group in &manifest.instance_groups {
        let colocated = group.colocated_containers();
        if group.is_colocated() || colocated.is_empty() {
            continue;
        }
        // One pod network: collect every port of the group and its
        // colocated containers and look for duplicates.
        let mut seen: BTreeMap<(String, u32), Vec<String>> = BTreeMap::new();
        let mut collect = |g: &InstanceGroup| {
            for job_ref in &g.job_references {
                for port in &job_ref.properties.bosh_containerization.ports {
                    seen.entry((port.protocol.to_uppercase(), port.internal))
                        .or_default()
                        .push(format!("{}/{}", g.name, port.name));
                }
            }
        };
        collect(group);
        for name in colocated {
            if let Some(target) = manifest.lookup_instance_group(name) {
                collect(target);
            }
        }
        for ((protocol, port), users) in seen {
            if users.len() > 1 {
                errs.push(ValidationError::invalid(
                    format!("instance_groups[{}]", group.name),
                    &format!("{protocol}/{port}"),
                    &format!("Port collision between {}", users.join(", ")),
                ));
            }
        }
    }
    errs
}

fn validate_colocated_volume_shares(manifest: &RoleManifest) -> ErrorList {
    let mut errs = ErrorList::new();
    for group in &manifest.instance_groups {
        let colocated = group.colocated_containers();
        if group.is_colocated() || colocated.is_empty() {
            continue;
        }
        let parent_tags: BTreeSet<&str> = group
            .run
            .iter()
            .flat_map(|r| &r.volumes)
            .map(|v| v.tag.as_str())
            .filter(|t| !t.is_empty())
            .collect();
        for name in colocated {
            let Some(target) = manifest.lookup_instance_group(name) else {
                continue;
            };
            for volume in target.run.iter().flat_map(|r| &r.volumes) {
                if !volume.tag.is_empty() && !parent_tags.contains(volume.tag.as_str()) {
                    errs.push(ValidationError::required(
                        format!("instance_groups[{}].run.volumes", target.name),
                        &format!(
                            "colocated container uses volume tag {} that parent {} does not share",
                            volume.tag, group.name
                        ),
                    ));
                }
            }
        }
    }
    errs
}

#[derive(Debug, Default)]
struct PropertyInfo {
    maybe_hash: bool,
}

/// Property names of every included job, with whether the property may carry
/// a hash. A mapping default means yes; so does a null default, which works
/// around spec files whose hash-valued properties have no default at all.
fn collect_property_defaults(manifest: &RoleManifest) -> BTreeMap<String, PropertyInfo> {
    let mut result: BTreeMap<String, PropertyInfo> = BTreeMap::new();
    for group in &manifest.instance_groups {
        for job_ref in &group.job_references {
            let Some(job) = &job_ref.job else { continue };
            for property in &job.properties {
                let info = result.entry(property.name.clone()).or_default();
                if property.default.is_null() || property.default.is_mapping() {
                    info.maybe_hash = true;
                }
            }
        }
    }
    result
}

/// Extract the `((VAR))` references from a template value.
fn scan_variable_refs(value: &str) -> Vec<&str> {
    let mut refs = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find("((") {
        let after = &rest[start + 2..];
        match after.find("))") {
            Some(end) => {
                refs.push(&after[..end]);
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    refs
}

fn validate_template_usage(manifest: &RoleManifest) -> ErrorList {
    let mut errs = ErrorList::new();
    let defaults = collect_property_defaults(manifest);
    let declared: BTreeSet<&str> = manifest.variables.iter().map(|v| v.name.as_str()).collect();

    for (key, def) in &manifest.configuration.resolved_templates {
        for var in scan_variable_refs(&def.value) {
            if !declared.contains(var) {
                errs.push(ValidationError::not_found(
                    format!("configuration.templates[{key}]"),
                    &format!("No variable declaration of {var}"),
                ));
            }
        }

        let Some(property) = key.strip_prefix("properties.") else {
            continue;
        };
        if defaults.contains_key(property) {
            continue;
        }
        // A template may extend a hash-valued property (or one whose null
        // default leaves the kind open) with arbitrary sub-keys.
        let extends_hash = defaults.iter().any(|(name, info)| {
            info.maybe_hash && property.starts_with(&format!("{name}."))
        });
        if !extends_hash {
            errs.push(ValidationError::not_found(
                format!("configuration.templates[{key}]"),
                "Not used as a property of any job in the deployment",
            ));
        }
    }
    errs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::ReleaseBuilder;
    use std::path::Path;

    fn demo_release(dir: &Path) -> Release {
        ReleaseBuilder::new("demo", "1")
            .package("dep", &[])
            .job_from_mf(
                r#"
name: nats
packages: [dep]
properties:
  nats.user:
    default: admin
provides:
- name: nats
  type: nats
  properties: [nats.user]
"#,
                &[],
            )
            .job_from_mf(
                r#"
name: router
properties:
  router.port:
    default: 80
consumes:
- name: nats
  type: nats
- name: metrics
  type: metrics
  optional: true
provides:
- name: web
  type: http
"#,
                &[],
            )
            .build(dir)
            .unwrap()
    }

    fn parse(yaml: &str, dir: &Path) -> RoleManifest {
        RoleManifest::parse(yaml, &dir.join("role-manifest.yml")).unwrap()
    }

    const RUN_BLOCK: &str = r#"
    properties:
      bosh_containerization:
        run:
          scaling: {min: 1, max: 3}
"#;

    fn two_group_manifest(dir: &Path) -> RoleManifest {
        parse(
            &format!(
                r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: messaging
  jobs:
  - name: nats
    release: demo
{RUN_BLOCK}
- name: gateway
  jobs:
  - name: router
    release: demo
{RUN_BLOCK}
"#
            ),
            dir,
        )
    }

    #[test]
    fn resolves_consumer_by_unique_type() {
        let dir = tempfile::tempdir().unwrap();
        let releases = vec![demo_release(dir.path())];
        let mut manifest = two_group_manifest(dir.path());

        resolve(&mut manifest, &releases).unwrap();

        let router = manifest.instance_groups[1].lookup_job("router").unwrap();
        let bound = &router.resolved_consumes["nats"];
        assert_eq!(bound.role_name, "messaging");
        assert_eq!(bound.job_name, "nats");
        assert_eq!(bound.link_type, "nats");
        assert_eq!(bound.service_name, "messaging-nats");
    }

    #[test]
    fn optional_consumer_may_stay_unbound() {
        let dir = tempfile::tempdir().unwrap();
        let releases = vec![demo_release(dir.path())];
        let mut manifest = two_group_manifest(dir.path());
        resolve(&mut manifest, &releases).unwrap();

        let router = manifest.instance_groups[1].lookup_job("router").unwrap();
        assert!(!router.resolved_consumes.contains_key("metrics"));
    }

    #[test]
    fn provider_records_its_consumers() {
        let dir = tempfile::tempdir().unwrap();
        let releases = vec![demo_release(dir.path())];
        let mut manifest = two_group_manifest(dir.path());
        resolve(&mut manifest, &releases).unwrap();

        let nats = manifest.instance_groups[0].lookup_job("nats").unwrap();
        let consumers = &nats.resolved_consumed_by["nats"];
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].role_name, "gateway");
        assert_eq!(consumers[0].job_name, "router");
    }

    #[test]
    fn two_providers_of_a_type_break_unnamed_resolution() {
        let dir = tempfile::tempdir().unwrap();
        // a second job providing another link of type nats
        let release = ReleaseBuilder::new("demo", "1")
            .job_from_mf(
                r#"
name: nats
provides:
- name: nats
  type: nats
"#,
                &[],
            )
            .job_from_mf(
                r#"
name: nats-tls
provides:
- name: nats-tls
  type: nats
"#,
                &[],
            )
            .job_from_mf(
                r#"
name: worker
consumes:
- name: ""
  type: nats
"#,
                &[],
            )
            .build(dir.path())
            .unwrap();
        let mut manifest = parse(
            &format!(
                r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: bus
  jobs:
  - name: nats
    release: demo
  - name: nats-tls
    release: demo
{RUN_BLOCK}
- name: workers
  jobs:
  - name: worker
    release: demo
{RUN_BLOCK}
"#
            ),
            dir.path(),
        );
        let err = resolve(&mut manifest, &[release]).unwrap_err();
        let ModelError::Validation(list) = err else {
            panic!("expected validation diagnostics")
        };
        assert!(list
            .iter()
            .any(|e| e.kind == crate::ErrorKind::Required
                && e.path.contains("job[worker].consumes")));
    }

    #[test]
    fn alias_export_resolves_named_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let release = ReleaseBuilder::new("demo", "1")
            .job_from_mf(
                r#"
name: nats
provides:
- name: nats
  type: nats
"#,
                &[],
            )
            .job_from_mf(
                r#"
name: router
consumes:
- name: message-bus
  type: nats
"#,
                &[],
            )
            .build(dir.path())
            .unwrap();
        let mut manifest = parse(
            &format!(
                r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: messaging
  jobs:
  - name: nats
    release: demo
    provides:
      nats: {{as: message-bus}}
{RUN_BLOCK}
- name: gateway
  jobs:
  - name: router
    release: demo
{RUN_BLOCK}
"#
            ),
            dir.path(),
        );
        resolve(&mut manifest, &[release]).unwrap();
        let router = manifest.instance_groups[1].lookup_job("router").unwrap();
        assert_eq!(router.resolved_consumes["message-bus"].job_name, "nats");
    }

    #[test]
    fn explicit_consume_override_with_ignore_drops_binding() {
        let dir = tempfile::tempdir().unwrap();
        let release = demo_release(dir.path());
        let mut manifest = parse(
            &format!(
                r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: messaging
  jobs:
  - name: nats
    release: demo
    provides:
      nats: {{}}
{RUN_BLOCK}
- name: gateway
  jobs:
  - name: router
    release: demo
    consumes:
      nats: {{from: nats, ignore: true}}
{RUN_BLOCK}
"#
            ),
            dir.path(),
        );
        resolve(&mut manifest, &[release]).unwrap();
        let router = manifest.instance_groups[1].lookup_job("router").unwrap();
        assert!(!router.resolved_consumes.contains_key("nats"));
    }

    #[test]
    fn unknown_group_type_and_tag_are_diagnosed() {
        let dir = tempfile::tempdir().unwrap();
        let release = demo_release(dir.path());
        let mut manifest = parse(
            &format!(
                r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: messaging
  type: vm
  tags: [made-up]
  jobs:
  - name: nats
    release: demo
{RUN_BLOCK}
"#
            ),
            dir.path(),
        );
        let ModelError::Validation(list) = resolve(&mut manifest, &[release]).unwrap_err()
        else {
            panic!("expected validation diagnostics")
        };
        assert!(list.iter().any(|e| e.path == "instance_groups[messaging].type"));
        assert!(list.iter().any(|e| e.path == "instance_groups[messaging].tags"));
    }

    #[test]
    fn feature_guards_are_mutually_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let release = demo_release(dir.path());
        let mut manifest = parse(
            &format!(
                r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: messaging
  if_feature: a
  unless_feature: b
  jobs:
  - name: nats
    release: demo
{RUN_BLOCK}
"#
            ),
            dir.path(),
        );
        let ModelError::Validation(list) = resolve(&mut manifest, &[release]).unwrap_err()
        else {
            panic!("expected validation diagnostics")
        };
        assert!(list
            .iter()
            .any(|e| e.kind == crate::ErrorKind::Forbidden
                && e.message.contains("mutually exclusive")));
    }

    #[test]
    fn empty_type_defaults_to_bosh_and_features_register() {
        let dir = tempfile::tempdir().unwrap();
        let release = demo_release(dir.path());
        let mut manifest = parse(
            &format!(
                r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: messaging
  default_feature: queues
  jobs:
  - name: nats
    release: demo
{RUN_BLOCK}
"#
            ),
            dir.path(),
        );
        resolve(&mut manifest, &[release]).unwrap();
        assert_eq!(manifest.instance_groups[0].group_type, "bosh");
        assert_eq!(manifest.features.get("queues"), Some(&true));
    }

    #[test]
    fn missing_job_and_missing_release_are_diagnosed() {
        let dir = tempfile::tempdir().unwrap();
        let release = demo_release(dir.path());
        let mut manifest = parse(
            &format!(
                r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: messaging
  jobs:
  - name: ghost
    release: demo
{RUN_BLOCK}
- name: other
  jobs:
  - name: nats
    release: unloaded
{RUN_BLOCK}
"#
            ),
            dir.path(),
        );
        let ModelError::Validation(list) = resolve(&mut manifest, &[release]).unwrap_err()
        else {
            panic!("expected validation diagnostics")
        };
        assert!(list
            .iter()
            .any(|e| e.message.contains("Job ghost not found in release demo")));
        assert!(list
            .iter()
            .any(|e| e.message.contains("Referenced release unloaded is not loaded")));
    }

    #[test]
    fn run_aggregation_requires_a_run_block() {
        let mut group: InstanceGroup = serde_yaml::from_str(
            r#"
name: bare
jobs:
- name: a
  release: demo
"#,
        )
        .unwrap();
        let errs = calculate_role_run(&mut group);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs.iter().next().unwrap().kind, crate::ErrorKind::Required);
    }

    #[test]
    fn run_aggregation_unions_capabilities_and_maxes_resources() {
        let mut group: InstanceGroup = serde_yaml::from_str(
            r#"
name: api
jobs:
- name: a
  release: demo
  properties:
    bosh_containerization:
      run:
        capabilities: [NET_ADMIN]
        memory: {request: 128, limit: 256}
- name: b
  release: demo
  properties:
    bosh_containerization:
      run:
        capabilities: [SYS_PTRACE, NET_ADMIN]
        memory: {request: 512}
"#,
        )
        .unwrap();
        let errs = calculate_role_run(&mut group);
        assert!(errs.is_empty(), "{errs}");
        let run = group.run.unwrap();
        assert_eq!(run.capabilities, vec!["NET_ADMIN", "SYS_PTRACE"]);
        let memory = run.memory.unwrap();
        assert_eq!(memory.request, Some(512));
        assert_eq!(memory.limit, Some(256));
    }

    #[test]
    fn run_aggregation_rejects_two_healthchecks_and_distinct_accounts() {
        let mut group: InstanceGroup = serde_yaml::from_str(
            r#"
name: api
jobs:
- name: a
  release: demo
  properties:
    bosh_containerization:
      run:
        healthcheck: {readiness: {url: http://a/健康}}
        service-account: one
- name: b
  release: demo
  properties:
    bosh_containerization:
      run:
        healthcheck: {readiness: {url: http://b/}}
        service-account: two
"#,
        )
        .unwrap();
        let errs = calculate_role_run(&mut group);
        assert!(errs.iter().any(|e| e.message.contains("healthcheck")));
        assert!(errs.iter().any(|e| e.message.contains("service-account")));
    }

    #[test]
    fn run_aggregation_detects_volume_tag_path_conflict() {
        let mut group: InstanceGroup = serde_yaml::from_str(
            r#"
name: api
jobs:
- name: a
  release: demo
  properties:
    bosh_containerization:
      run:
        volumes:
        - {type: persistent, path: /data, tag: shared}
- name: b
  release: demo
  properties:
    bosh_containerization:
      run:
        volumes:
        - {type: persistent, path: /other, tag: shared}
"#,
        )
        .unwrap();
        let errs = calculate_role_run(&mut group);
        assert!(errs.iter().any(|e| e.message.contains("conflicting paths")));
        let run = group.run.unwrap();
        assert_eq!(run.volumes.len(), 1);
    }

    #[test]
    fn flight_stage_must_agree() {
        let mut group: InstanceGroup = serde_yaml::from_str(
            r#"
name: api
jobs:
- name: a
  release: demo
  properties:
    bosh_containerization:
      run: {flight-stage: flight}
- name: b
  release: demo
  properties:
    bosh_containerization:
      run: {flight-stage: pre-flight}
"#,
        )
        .unwrap();
        let errs = calculate_role_run(&mut group);
        assert!(errs.iter().any(|e| e.message.contains("flight-stage")));
    }

    #[test]
    fn authorization_accounting_links_accounts_roles_and_groups() {
        let dir = tempfile::tempdir().unwrap();
        let release = demo_release(dir.path());
        let mut manifest = parse(
            r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: messaging
  jobs:
  - name: nats
    release: demo
    properties:
      bosh_containerization:
        run:
          scaling: {min: 1, max: 1}
          service-account: bus-account
configuration:
  authorization:
    accounts:
      bus-account:
        roles: [bus-role]
    roles:
      bus-role:
      - apiGroups: [""]
        resources: [pods]
        verbs: [get]
"#,
            dir.path(),
        );
        resolve(&mut manifest, &[release]).unwrap();
        let authorization = &manifest.configuration.authorization;
        assert!(authorization.accounts["bus-account"]
            .used_by
            .contains("messaging"));
        assert!(authorization.role_used_by["bus-role"].contains("bus-account"));
    }

    #[test]
    fn global_validation_covers_variables_and_templates() {
        let dir = tempfile::tempdir().unwrap();
        let release = demo_release(dir.path());
        let mut manifest = parse(
            &format!(
                r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: messaging
  jobs:
  - name: nats
    release: demo
{RUN_BLOCK}
configuration:
  templates:
    properties.nats.user: '((NATS_USER))'
    properties.unknown.prop: static
variables:
- name: NATS_USER
  options:
    description: nats username
    type: hologram
- name: UNDESCRIBED
  options: {{}}
"#
            ),
            dir.path(),
        );
        let ModelError::Validation(list) = resolve(&mut manifest, &[release]).unwrap_err()
        else {
            panic!("expected validation diagnostics")
        };
        assert!(list.iter().any(|e| e.path == "variables[NATS_USER].type"));
        assert!(list
            .iter()
            .any(|e| e.path == "variables[UNDESCRIBED].description"));
        assert!(list
            .iter()
            .any(|e| e.path == "configuration.templates[properties.unknown.prop]"));
        // the known property template passes, so it must not be reported
        assert!(!list
            .iter()
            .any(|e| e.path == "configuration.templates[properties.nats.user]"
                && e.message.contains("Not used")));
    }

    #[test]
    fn template_may_extend_null_default_property() {
        let dir = tempfile::tempdir().unwrap();
        let release = ReleaseBuilder::new("demo", "1")
            .job_from_mf(
                r#"
name: api
properties:
  api.quota_definitions:
    description: open-ended hash
"#,
                &[],
            )
            .build(dir.path())
            .unwrap();
        let mut manifest = parse(
            &format!(
                r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: api
  jobs:
  - name: api
    release: demo
{RUN_BLOCK}
configuration:
  templates:
    properties.api.quota_definitions.default.memory: "1024"
"#
            ),
            dir.path(),
        );
        resolve(&mut manifest, &[release]).unwrap();
    }

    #[test]
    fn unresolvable_variable_reference_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let release = demo_release(dir.path());
        let mut manifest = parse(
            &format!(
                r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: messaging
  jobs:
  - name: nats
    release: demo
{RUN_BLOCK}
configuration:
  templates:
    properties.nats.user: '((GHOST_VAR))'
"#
            ),
            dir.path(),
        );
        let ModelError::Validation(list) = resolve(&mut manifest, &[release]).unwrap_err()
        else {
            panic!("expected validation diagnostics")
        };
        assert!(list.iter().any(|e| e.message.contains("GHOST_VAR")));
    }

    #[test]
    fn colocated_container_rules() {
        let dir = tempfile::tempdir().unwrap();
        let release = ReleaseBuilder::new("demo", "1")
            .job_from_mf(
                "name: main\nprovides: []\n",
                &[],
            )
            .job_from_mf("name: sidecar\n", &[])
            .build(dir.path())
            .unwrap();
        let mut manifest = parse(
            r#"
releases:
- name: demo
  version: "1"
instance_groups:
- name: web
  jobs:
  - name: main
    release: demo
    properties:
      bosh_containerization:
        run:
          scaling: {min: 1, max: 1}
        ports:
        - {name: http, internal: 8080}
        colocated_containers: [logger]
- name: logger
  type: colocated-container
  jobs:
  - name: sidecar
    release: demo
    properties:
      bosh_containerization:
        run:
          scaling: {min: 1, max: 1}
          volumes:
          - {type: shared, path: /logs, tag: logdir}
        ports:
        - {name: http-again, internal: 8080}
- name: orphan
  type: colocated-container
  jobs:
  - name: sidecar
    release: demo
    properties:
      bosh_containerization:
        run:
          scaling: {min: 1, max: 1}
"#,
            dir.path(),
        );
        let ModelError::Validation(list) = resolve(&mut manifest, &[release]).unwrap_err()
        else {
            panic!("expected validation diagnostics")
        };
        assert!(
            list.iter().any(|e| e.message.contains("Port collision")),
            "{list}"
        );
        assert!(list
            .iter()
            .any(|e| e.message.contains("volume tag logdir")));
        assert!(list
            .iter()
            .any(|e| e.path == "instance_groups[orphan]"
                && e.message.contains("not used by any other instance group")));
    }

    #[test]
    fn duplicate_release_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let one = demo_release(dir.path());
        let two = demo_release(&dir.path().join("copy"));
        let mut manifest = parse("instance_groups: []", dir.path());
        let err = resolve(&mut manifest, &[one, two]).unwrap_err();
        assert!(matches!(err, ModelError::DuplicateRelease(_)));
    }

    #[test]
    fn kebab_lowers_and_dashes() {
        assert_eq!(kebab("MySQL_Proxy"), "mysql-proxy");
    }

    #[test]
    fn variable_scan_finds_all_refs() {
        assert_eq!(
            scan_variable_refs("((A)) and ((B_NAME)) but not (C)"),
            vec!["A", "B_NAME"]
        );
        assert!(scan_variable_refs("plain").is_empty());
    }
}
