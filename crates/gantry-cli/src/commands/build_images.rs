use super::{ConsoleLog, GlobalOptions, EXIT_SUCCESS};
use gantry_cache::{DirCache, PackageCache};
use gantry_compiler::{Compilator, GraphWriter, Metrics, ModelGrapher};
use gantry_kube::{
    collect_packages, role_dev_versions, write_deployment, ExportSettings, PackagesImageBuilder,
    RoleImageBuilder,
};
use gantry_model::{
    resolve, InstanceGroup, Opinions, Release, ReleaseKind, RoleManifest,
};
use gantry_runtime::{sanitize_name, select_backend};
use gantry_store::CompiledStore;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Options for `gantry build images`.
#[derive(Debug, Clone, Default)]
pub struct BuildImagesOptions {
    pub roles: Vec<String>,
    pub stemcell: String,
    pub stemcell_os: String,
    pub tag_extra: String,
    pub force: bool,
    pub no_build: bool,
    pub output_directory: Option<PathBuf>,
    pub labels: BTreeMap<String, String>,
    pub output_graph: Option<PathBuf>,
    pub helm: bool,
}

/// The compile path: load → resolve → compile → emit.
pub fn run(globals: &GlobalOptions, options: &BuildImagesOptions) -> Result<u8, String> {
    let mut options = options.clone();
    if options.output_directory.is_some() && !options.force {
        // The engine is not consulted in tarball mode, so there is nothing
        // to compare against; always rebuild.
        options.force = true;
    }

    // Load and resolve phase.
    let pb = super::spinner("loading releases and resolving manifest...");
    let loaded: Result<(RoleManifest, Vec<Release>), String> = (|| {
        let mut manifest =
            RoleManifest::load_from_file(&globals.manifest).map_err(|e| e.to_string())?;
        let mut releases = Vec::with_capacity(globals.releases.len());
        for path in &globals.releases {
            let kind = match &globals.dev_cache_dir {
                Some(cache_dir) => ReleaseKind::Dev {
                    cache_dir: cache_dir.clone(),
                },
                None => ReleaseKind::Final,
            };
            releases.push(Release::load(path, kind).map_err(|e| e.to_string())?);
        }
        resolve(&mut manifest, &releases).map_err(|e| e.to_string())?;
        Ok((manifest, releases))
    })();
    let (manifest, releases) = match loaded {
        Ok(loaded) => {
            super::spin_ok(&pb, "manifest resolved");
            loaded
        }
        Err(message) => {
            super::spin_fail(&pb, "load failed");
            return Err(message);
        }
    };
    let groups: Vec<&InstanceGroup> = manifest
        .select_instance_groups(&options.roles)
        .map_err(|e| e.to_string())?;

    let opinions = match (&globals.light_opinions, &globals.dark_opinions) {
        (Some(light), Some(dark)) => {
            Some(Opinions::load(light, dark).map_err(|e| e.to_string())?)
        }
        _ => None,
    };

    // Compile phase.
    let backend = Arc::from(select_backend(&globals.engine).map_err(|e| e.to_string())?);
    let store = CompiledStore::new(
        globals
            .work_dir
            .join("compilation")
            .join(sanitize_name(&options.stemcell)),
    );
    let grapher: Option<Arc<GraphWriter>> = options.output_graph.as_ref().map(|_| {
        let writer = Arc::new(GraphWriter::new());
        for release in &releases {
            writer.graph_node(
                &format!("release/{}", release.name),
                &format!("release/{}", release.name),
            );
        }
        writer
    });

    let mut compilator = Compilator::new(
        Arc::clone(&backend),
        store.clone(),
        options.stemcell.clone(),
        options.stemcell_os.clone(),
        env!("CARGO_PKG_VERSION"),
    )
    .with_log(Arc::new(ConsoleLog));
    if let Some(metrics) = &globals.metrics {
        compilator = compilator.with_metrics(Metrics::new(metrics));
    }
    if let Some(cache_dir) = &globals.cache_dir {
        let cache = DirCache::new(cache_dir, globals.cache_read_only);
        compilator = compilator.with_cache(Arc::new(cache) as Arc<dyn PackageCache>);
    }
    if let Some(writer) = &grapher {
        compilator =
            compilator.with_grapher(Arc::clone(writer) as Arc<dyn ModelGrapher>);
    }

    if let Err(error) = compilator.compile(globals.worker_count(), &releases, Some(&groups)) {
        return Err(format!("compilation failed: {error}"));
    }

    // Emit phase.
    let settings = ExportSettings {
        repository: globals.repository.clone(),
        registry: globals.registry.clone(),
        organization: globals.organization.clone(),
        helm_chart: options.helm,
        tag_extra: options.tag_extra.clone(),
        tool_version: env!("CARGO_PKG_VERSION").to_owned(),
        force: options.force,
        no_build: options.no_build,
    };

    let dev_versions = role_dev_versions(
        &groups,
        opinions.as_ref(),
        &settings,
        manifest.manifest_dir(),
    )
    .map_err(|e| e.to_string())?;
    let packages = collect_packages(&groups, &releases);

    let packages_builder = PackagesImageBuilder {
        settings: &settings,
        store: &store,
        stemcell_image: options.stemcell.clone(),
    };

    let packages_image = match &options.output_directory {
        Some(output_dir) => {
            let tarball = packages_builder
                .write_tarball(&packages, &dev_versions, &options.labels, output_dir)
                .map_err(|e| e.to_string())?;
            println!("wrote packages layer {}", tarball.display());
            packages_builder.image_name(&dev_versions)
        }
        None => packages_builder
            .build(backend.as_ref(), &packages, &dev_versions, &options.labels)
            .map_err(|e| e.to_string())?,
    };

    let role_builder = RoleImageBuilder {
        settings: &settings,
        base_image: packages_image,
        manifest_dir: manifest.manifest_dir().to_path_buf(),
    };
    let mut images: BTreeMap<String, String> = BTreeMap::new();
    for (group, (group_name, dev_version)) in groups.iter().zip(&dev_versions) {
        let image = match &options.output_directory {
            Some(output_dir) => {
                let context = role_builder.context_tar(group).map_err(|e| e.to_string())?;
                let name =
                    gantry_kube::role_image_name(&settings, group_name, dev_version);
                let path = output_dir.join(format!("{}.tar", sanitize_name(&name)));
                std::fs::write(&path, context).map_err(|e| e.to_string())?;
                println!("wrote role image context {}", path.display());
                name
            }
            None => role_builder
                .build(backend.as_ref(), group, dev_version, &options.labels)
                .map_err(|e| e.to_string())?,
        };
        images.insert(group_name.clone(), image);
    }

    if let Some(output_dir) = &options.output_directory {
        write_deployment(&manifest, &groups, &images, &settings, output_dir)
            .map_err(|e| e.to_string())?;
    }

    if let (Some(writer), Some(path)) = (&grapher, &options.output_graph) {
        writer.write_to(path).map_err(|e| e.to_string())?;
        println!("wrote dependency graph {}", path.display());
    }

    println!("built {} instance group image(s)", images.len());
    Ok(EXIT_SUCCESS)
}
