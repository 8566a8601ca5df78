use crate::buckets::create_dep_buckets;
use crate::graph::ModelGrapher;
use crate::metrics::Metrics;
use crate::signal::Signal;
use crate::CompileError;
use gantry_cache::{pack_compiled, unpack_compiled, PackageCache, PROGRESS_DONE};
use gantry_model::{InstanceGroup, Package, Release};
use gantry_runtime::{
    compilation_container_name, save_compilation_script, ContainerBackend, RunOpts,
    CONTAINER_IN_PATH, CONTAINER_OUT_PATH, CONTAINER_SOURCE_DIR,
};
use gantry_store::CompiledStore;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// How long a worker waits on one dependency before emitting a liveness line.
const WAIT_TICK: Duration = Duration::from_secs(5);

/// Granularity of the dependency wait. Short enough that a kill broadcast is
/// observed promptly while a worker sits in the wait gate.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// State transitions surfaced to the user while compiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Waiting,
    DepDone,
    Compile,
    Result,
    Cache,
    Killed,
    Done,
}

impl ProgressState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressState::Waiting => "waiting",
            ProgressState::DepDone => "depdone",
            ProgressState::Compile => "compile",
            ProgressState::Result => "result",
            ProgressState::Cache => "cache",
            ProgressState::Killed => "killed",
            ProgressState::Done => "done",
        }
    }
}

/// Sink for user-facing compile progress lines.
pub trait ProgressLog: Send + Sync {
    fn line(&self, state: ProgressState, message: &str);
}

/// Discards all progress output.
pub struct NullLog;

impl ProgressLog for NullLog {
    fn line(&self, _state: ProgressState, _message: &str) {}
}

type CompileResult = (Arc<Package>, Option<CompileError>);

/// The package compiler.
///
/// Concurrency works like this: one producer (the `compile` call itself)
/// loads the queue, N workers consume it, and one synchronizer (the same
/// call, after submission) drains exactly one result per queued package.
/// Workers wait for their dependencies on a map of close-once signals keyed
/// by fingerprint; the synchronizer closes a signal when the matching
/// package succeeds. The first failure closes the `kill` signal, which
/// waiting workers observe; packages without dependencies never check it
/// and simply run.
pub struct Compilator {
    backend: Arc<dyn ContainerBackend>,
    store: CompiledStore,
    stemcell_image: String,
    base_type: String,
    tool_version: String,
    network_mode: Option<String>,
    keep_container: bool,
    stream_packages: bool,
    metrics: Option<Metrics>,
    cache: Option<Arc<dyn PackageCache>>,
    grapher: Option<Arc<dyn ModelGrapher>>,
    log: Arc<dyn ProgressLog>,
}

impl Compilator {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        store: CompiledStore,
        stemcell_image: impl Into<String>,
        base_type: impl Into<String>,
        tool_version: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            store,
            stemcell_image: stemcell_image.into(),
            base_type: base_type.into(),
            tool_version: tool_version.into(),
            network_mode: None,
            keep_container: false,
            stream_packages: false,
            metrics: None,
            cache: None,
            grapher: None,
            log: Arc::new(NullLog),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn PackageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_grapher(mut self, grapher: Arc<dyn ModelGrapher>) -> Self {
        self.grapher = Some(grapher);
        self
    }

    pub fn with_log(mut self, log: Arc<dyn ProgressLog>) -> Self {
        self.log = log;
        self
    }

    pub fn with_network_mode(mut self, mode: Option<String>) -> Self {
        self.network_mode = mode;
        self
    }

    pub fn keep_container(mut self, keep: bool) -> Self {
        self.keep_container = keep;
        self
    }

    pub fn stream_packages(mut self, stream: bool) -> Self {
        self.stream_packages = stream;
        self
    }

    pub fn store(&self) -> &CompiledStore {
        &self.store
    }

    /// Compile every package the selected instance groups need (or, with no
    /// selection, every package of every release), honoring the dependency
    /// DAG. Returns after all submitted jobs have produced a result; the
    /// first failure, if any, is the returned error.
    pub fn compile(
        &self,
        worker_count: usize,
        releases: &[Release],
        instance_groups: Option<&[&InstanceGroup]>,
    ) -> Result<(), CompileError> {
        if let Some(metrics) = &self.metrics {
            metrics.stamp("compile-packages", "start");
        }
        let result = self.compile_inner(worker_count, releases, instance_groups);
        if let Some(metrics) = &self.metrics {
            metrics.stamp("compile-packages", "done");
        }
        result
    }

    fn compile_inner(
        &self,
        worker_count: usize,
        releases: &[Release],
        instance_groups: Option<&[&InstanceGroup]>,
    ) -> Result<(), CompileError> {
        // Single-threaded setup: populate the signal map and the input set.
        // After this point the map is never written again; workers only read
        // it, and only the synchronizer closes signals.
        let mut signals: HashMap<String, Signal> = HashMap::new();
        let packages = self.gather_packages(releases, instance_groups, &mut signals);
        let packages = self.remove_compiled_packages(packages, &signals)?;

        if packages.is_empty() {
            self.log.line(ProgressState::Done, "no package needed to be built");
            return Ok(());
        }

        let buckets = create_dep_buckets(&packages)?;
        debug!("compiling {} packages with {worker_count} workers", buckets.len());

        let kill = Signal::new();
        let total = buckets.len();
        let (job_tx, job_rx) = mpsc::channel::<Arc<Package>>();
        let (result_tx, result_rx) = mpsc::channel::<CompileResult>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        for pkg in buckets {
            // The receiver outlives this loop, so a send cannot fail.
            let _ = job_tx.send(pkg);
        }
        drop(job_tx);

        let mut first_error: Option<CompileError> = None;
        std::thread::scope(|scope| {
            for _ in 0..worker_count.max(1) {
                let job_rx = Arc::clone(&job_rx);
                let result_tx = result_tx.clone();
                let kill = kill.clone();
                let signals = &signals;
                scope.spawn(move || loop {
                    let next = {
                        let receiver = job_rx
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        receiver.recv()
                    };
                    let Ok(pkg) = next else { break };
                    self.run_job(pkg, signals, &kill, &result_tx);
                });
            }
            drop(result_tx);

            // Synchronizer: one result per submitted job, drained fully so
            // no worker leaks even after a failure.
            let mut killed = false;
            for _ in 0..total {
                let Ok((pkg, error)) = result_rx.recv() else {
                    if first_error.is_none() {
                        first_error = Some(CompileError::ResultChannelClosed);
                    }
                    break;
                };
                match error {
                    None => {
                        if let Some(signal) = signals.get(&pkg.fingerprint) {
                            signal.close();
                        }
                        self.log.line(
                            ProgressState::Result,
                            &format!("success: {}/{}", pkg.release_name, pkg.name),
                        );
                    }
                    Some(error) => {
                        self.log.line(
                            ProgressState::Result,
                            &format!("failure: {}/{} - {error}", pkg.release_name, pkg.name),
                        );
                        if !killed {
                            kill.close();
                            killed = true;
                        }
                        if first_error.is_none() {
                            first_error = Some(error);
                        }
                    }
                }
            }
        });

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Collect the packages to compile and create one signal per distinct
    /// fingerprint. Only the first package seen per fingerprint enters the
    /// input set; equivalent packages from other releases ride on its
    /// signal.
    fn gather_packages(
        &self,
        releases: &[Release],
        instance_groups: Option<&[&InstanceGroup]>,
        signals: &mut HashMap<String, Signal>,
    ) -> Vec<Arc<Package>> {
        let mut packages = Vec::new();
        for release in releases {
            let release_packages = match instance_groups {
                Some(groups) => gather_packages_from_instance_groups(release, groups),
                None => release.packages.clone(),
            };
            for pkg in release_packages {
                if !signals.contains_key(&pkg.fingerprint) {
                    signals.insert(pkg.fingerprint.clone(), Signal::new());
                    packages.push(pkg);
                }
            }
        }
        packages
    }

    /// Drop packages already present in the compiled store, closing their
    /// signals so dependents proceed immediately.
    fn remove_compiled_packages(
        &self,
        packages: Vec<Arc<Package>>,
        signals: &HashMap<String, Signal>,
    ) -> Result<Vec<Arc<Package>>, CompileError> {
        let mut remaining = Vec::with_capacity(packages.len());
        for pkg in packages {
            if let Some(grapher) = &self.grapher {
                grapher.graph_node(&pkg.fingerprint, &format!("pkg/{}", pkg.name));
                grapher.graph_edge(&self.stemcell_image, &pkg.fingerprint);
                grapher.graph_edge(&format!("release/{}", pkg.release_name), &pkg.fingerprint);
                for dep in &pkg.dependencies {
                    grapher.graph_edge(&dep.fingerprint, &pkg.fingerprint);
                }
            }

            if self.store.is_compiled(&pkg.name, &pkg.fingerprint)? {
                if let Some(signal) = signals.get(&pkg.fingerprint) {
                    signal.close();
                }
                self.log.line(
                    ProgressState::Done,
                    &format!("found {} in compiled store", pkg.name),
                );
            } else {
                remaining.push(pkg);
            }
        }
        Ok(remaining)
    }

    /// One worker execution: wait for dependencies, then cache-or-compile,
    /// and send exactly one result.
    fn run_job(
        &self,
        pkg: Arc<Package>,
        signals: &HashMap<String, Signal>,
        kill: &Signal,
        results: &mpsc::Sender<CompileResult>,
    ) {
        let series = format!("{}/{}", pkg.release_name, pkg.name);
        let wait_series = format!("compile-packages::wait::{series}");
        let run_series = format!("compile-packages::run::{series}");
        if let Some(metrics) = &self.metrics {
            metrics.stamp(&wait_series, "start");
        }

        // Dependency gate. Packages without dependencies skip the loop
        // entirely and thereby ignore the kill signal: letting them leak
        // through costs nothing.
        for dep in &pkg.dependencies {
            let Some(signal) = signals.get(&dep.fingerprint) else {
                continue;
            };
            let mut waited = Duration::ZERO;
            loop {
                if kill.is_closed() {
                    self.log.line(ProgressState::Killed, &series);
                    if let Some(metrics) = &self.metrics {
                        metrics.stamp(&wait_series, "done");
                    }
                    let _ = results.send((pkg, Some(CompileError::Aborted)));
                    return;
                }
                if signal.wait_timeout(WAIT_SLICE) {
                    self.log
                        .line(ProgressState::DepDone, &format!("{series} - {}", dep.name));
                    break;
                }
                waited += WAIT_SLICE;
                if waited >= WAIT_TICK {
                    waited = Duration::ZERO;
                    self.log
                        .line(ProgressState::Waiting, &format!("{series} - {}", dep.name));
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.stamp(&wait_series, "done");
        }

        self.log.line(ProgressState::Compile, &series);

        // Cache lookup first; a hit replaces compilation entirely.
        if let Some(cache) = &self.cache {
            self.log
                .line(ProgressState::Cache, &format!("searching for {}", pkg.name));
            match cache.exists(&pkg.fingerprint) {
                Err(error) => {
                    let _ = results.send((pkg, Some(error.into())));
                    return;
                }
                Ok(true) => {
                    self.log
                        .line(ProgressState::Cache, &format!("downloading {series}"));
                    let outcome = self.download_from_cache(cache.as_ref(), &pkg, &series);
                    let _ = results.send((pkg, outcome.err()));
                    return;
                }
                Ok(false) => {}
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.stamp(&run_series, "start");
        }
        let mut outcome = self.compile_package(&pkg);
        if outcome.is_ok() {
            if let Some(cache) = &self.cache {
                if !cache.read_only() {
                    self.log
                        .line(ProgressState::Cache, &format!("uploading {series}"));
                    outcome = self.upload_to_cache(cache.as_ref(), &pkg);
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.stamp(&run_series, "done");
        }

        self.log.line(ProgressState::Done, &series);
        let _ = results.send((pkg, outcome.err()));
    }

    fn download_from_cache(
        &self,
        cache: &dyn PackageCache,
        pkg: &Package,
        series: &str,
    ) -> Result<(), CompileError> {
        let mut last_bucket = 0i64;
        let log = &self.log;
        let data = cache.download(&pkg.fingerprint, &mut |progress| {
            if (progress - PROGRESS_DONE).abs() < f64::EPSILON {
                log.line(
                    ProgressState::Cache,
                    &format!("finished downloading {series}"),
                );
                return;
            }
            let bucket = (progress / 5.0) as i64;
            if bucket > last_bucket {
                last_bucket = bucket;
                log.line(
                    ProgressState::Cache,
                    &format!("{series} {}%", bucket * 5),
                );
            }
        })?;
        unpack_compiled(&data, &self.store.compiled_dir(&pkg.name, &pkg.fingerprint))?;
        Ok(())
    }

    fn upload_to_cache(
        &self,
        cache: &dyn PackageCache,
        pkg: &Package,
    ) -> Result<(), CompileError> {
        let data = pack_compiled(&self.store.compiled_dir(&pkg.name, &pkg.fingerprint))?;
        cache.upload(&pkg.fingerprint, &data)?;
        Ok(())
    }

    /// Compile one package inside the stemcell container: materialize the
    /// build directory, copy dependencies, extract sources, run the
    /// compilation script, and promote the output atomically.
    fn compile_package(&self, pkg: &Package) -> Result<(), CompileError> {
        self.store.prepare(&pkg.name, &pkg.fingerprint)?;
        for dep in &pkg.dependencies {
            self.store
                .copy_dependency(&pkg.name, &pkg.fingerprint, &dep.name, &dep.fingerprint)?;
        }

        let sources_dir = self.store.sources_dir(&pkg.name, &pkg.fingerprint);
        save_compilation_script(&self.base_type, &sources_dir.join("compile.sh"))?;
        pkg.extract(&self.store.source_dir(&pkg.name, &pkg.fingerprint))?;

        let container_name = compilation_container_name(
            &self.stemcell_image,
            &self.tool_version,
            &pkg.release_name,
            &pkg.release_version,
            &pkg.name,
        );
        let compiled_temp = self.store.compiled_temp_dir(&pkg.name, &pkg.fingerprint);

        let mut opts = RunOpts {
            container_name: container_name.clone(),
            image_name: self.stemcell_image.clone(),
            cmd: vec![
                "/bin/bash".to_owned(),
                format!("{CONTAINER_IN_PATH}/compile.sh"),
                pkg.name.clone(),
                pkg.version.clone(),
            ],
            volumes: vec![CONTAINER_SOURCE_DIR.to_owned()],
            keep_container: self.keep_container,
            network_mode: self.network_mode.clone(),
            ..RunOpts::default()
        };
        if self.stream_packages {
            // Remote engine: no shared filesystem, stream the trees instead.
            opts.stream_in = vec![(sources_dir, CONTAINER_IN_PATH.to_owned())];
            opts.stream_out = vec![(CONTAINER_OUT_PATH.to_owned(), compiled_temp)];
        } else {
            opts.mounts = vec![
                (sources_dir, CONTAINER_IN_PATH.to_owned()),
                (compiled_temp, CONTAINER_OUT_PATH.to_owned()),
            ];
        }

        let mut build_log: Vec<String> = Vec::new();
        let run_result = self.backend.run_in_container(&opts, &mut |_stream, line| {
            build_log.push(line.to_owned());
        });

        let exit_code = match run_result {
            Ok(code) => code,
            Err(error) => {
                self.replay_build_log(pkg, &build_log);
                self.remove_container_best_effort(&container_name);
                return Err(CompileError::CompilationFailed {
                    package: pkg.name.clone(),
                    detail: error.to_string(),
                });
            }
        };

        if exit_code != 0 {
            self.replay_build_log(pkg, &build_log);
            if !self.keep_container {
                self.remove_container_best_effort(&container_name);
            }
            return Err(CompileError::CompilationFailed {
                package: pkg.name.clone(),
                detail: format!("compilation exited with code {exit_code}"),
            });
        }

        self.backend.remove_container(&container_name)?;
        self.store.finalize(&pkg.name, &pkg.fingerprint)?;
        Ok(())
    }

    fn replay_build_log(&self, pkg: &Package, lines: &[String]) {
        for line in lines {
            self.log.line(
                ProgressState::Compile,
                &format!("compilation-{} > {line}", pkg.name),
            );
        }
    }

    fn remove_container_best_effort(&self, name: &str) {
        if let Err(error) = self.backend.remove_container(name) {
            debug!("cannot remove container {name}: {error}");
        }
    }
}

/// The packages a release contributes to the selected instance groups,
/// including transitive dependencies. A subset of the release's packages,
/// which avoids compiling what no selected group needs.
fn gather_packages_from_instance_groups(
    release: &Release,
    instance_groups: &[&InstanceGroup],
) -> Vec<Arc<Package>> {
    let mut pending: VecDeque<Arc<Package>> = VecDeque::new();
    for group in instance_groups {
        for job_ref in &group.job_references {
            if job_ref.release != release.name {
                continue;
            }
            let Some(job) = &job_ref.job else { continue };
            for pkg_ref in &job.packages {
                if let Some(pkg) = release.lookup_package(&pkg_ref.name) {
                    pending.push_back(pkg.clone());
                }
            }
        }
    }

    let mut listed: BTreeSet<String> = BTreeSet::new();
    let mut result = Vec::new();
    while let Some(pkg) = pending.pop_front() {
        if !listed.insert(pkg.name.clone()) {
            continue;
        }
        for dep in &pkg.dependencies {
            if let Some(dep_pkg) = release.lookup_package(&dep.name) {
                pending.push_back(dep_pkg.clone());
            }
        }
        result.push(pkg);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_model::fixtures::ReleaseBuilder;
    use gantry_model::{resolve, RoleManifest};
    use gantry_runtime::MockBackend;
    use std::path::Path;

    fn compiled_release(dir: &Path) -> Release {
        ReleaseBuilder::new("demo", "1")
            .package("base", &[])
            .package("lib", &["base"])
            .package("app", &["lib"])
            .job("svc", &["app"])
            .build(dir)
            .unwrap()
    }

    fn resolved_manifest(dir: &Path, releases: &[Release]) -> RoleManifest {
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
        resolve(&mut manifest, releases).unwrap();
        manifest
    }

    fn test_compilator(dir: &Path) -> (Arc<MockBackend>, Compilator) {
        let backend = Arc::new(MockBackend::new());
        backend.add_image("stemcell:latest");
        let compilator = Compilator::new(
            Arc::clone(&backend) as Arc<dyn ContainerBackend>,
            CompiledStore::new(dir.join("compilation")),
            "stemcell:latest",
            "ubuntu",
            "0.9.0",
        );
        (backend, compilator)
    }

    #[test]
    fn compiles_transitive_closure_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let releases = vec![compiled_release(dir.path())];
        let manifest = resolved_manifest(dir.path(), &releases);
        let groups: Vec<&InstanceGroup> = manifest.instance_groups.iter().collect();
        let (backend, compilator) = test_compilator(dir.path());

        compilator.compile(3, &releases, Some(&groups)).unwrap();

        let runs = backend.runs();
        assert_eq!(runs.len(), 3);
        let pos = |name: &str| {
            runs.iter()
                .position(|r| r.container_name.contains(&format!("-pkg-{name}-gkp")))
                .unwrap_or_else(|| panic!("no run for {name}"))
        };
        assert!(pos("base") < pos("lib"));
        assert!(pos("lib") < pos("app"));

        let store = compilator.store();
        for pkg in &releases[0].packages {
            assert!(store.is_compiled(&pkg.name, &pkg.fingerprint).unwrap());
        }

        // every compilation container was force-removed with its volumes
        assert_eq!(backend.removed_containers().len(), 3);
    }

    #[test]
    fn equivalent_packages_across_releases_compile_once() {
        let dir = tempfile::tempdir().unwrap();
        let one = ReleaseBuilder::new("one", "1")
            .package("shared", &[])
            .job("a", &["shared"])
            .build(dir.path())
            .unwrap();
        let two = ReleaseBuilder::new("two", "1")
            .package("shared", &[])
            .job("b", &["shared"])
            .build(&dir.path().join("second"))
            .unwrap();
        assert_eq!(one.packages[0].fingerprint, two.packages[0].fingerprint);

        let releases = vec![one, two];
        let (backend, compilator) = test_compilator(dir.path());
        compilator.compile(2, &releases, None).unwrap();

        let shared_runs = backend
            .runs()
            .iter()
            .filter(|r| r.container_name.contains("-pkg-shared-gkp"))
            .count();
        assert_eq!(shared_runs, 1, "one compile per fingerprint");
    }

    #[test]
    fn already_compiled_packages_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let releases = vec![compiled_release(dir.path())];
        let (backend, compilator) = test_compilator(dir.path());

        // Pre-populate the store for every package.
        for pkg in &releases[0].packages {
            let compiled = compilator.store().compiled_dir(&pkg.name, &pkg.fingerprint);
            std::fs::create_dir_all(&compiled).unwrap();
            std::fs::write(compiled.join("marker"), "done").unwrap();
        }

        compilator.compile(2, &releases, None).unwrap();
        assert!(backend.runs().is_empty());
    }

    #[test]
    fn first_failure_wins_and_run_drains() {
        let dir = tempfile::tempdir().unwrap();
        let release = ReleaseBuilder::new("demo", "1")
            .package("a", &[])
            .package("b", &["a"])
            .package("c", &["a"])
            .build(dir.path())
            .unwrap();
        let releases = vec![release];
        let (backend, compilator) = test_compilator(dir.path());
        backend.fail_containers_matching("-pkg-b-");

        let err = compilator.compile(3, &releases, None).unwrap_err();
        match err {
            CompileError::CompilationFailed { package, .. } => assert_eq!(package, "b"),
            CompileError::Aborted => {}
            other => panic!("unexpected error {other}"),
        }

        // c either compiled or aborted; if it compiled, its output exists.
        let store = compilator.store();
        let c = releases[0].lookup_package("c").unwrap();
        let c_ran = backend
            .runs()
            .iter()
            .any(|r| r.container_name.contains("-pkg-c-gkp"));
        if c_ran {
            assert!(store.is_compiled(&c.name, &c.fingerprint).unwrap());
        }
    }

    #[test]
    fn cache_hit_skips_compilation() {
        let dir = tempfile::tempdir().unwrap();
        let release = ReleaseBuilder::new("demo", "1")
            .package("cached", &[])
            .build(dir.path())
            .unwrap();
        let pkg = release.packages[0].clone();
        let releases = vec![release];

        // Prime a cache entry for the package's fingerprint.
        let payload_src = tempfile::tempdir().unwrap();
        std::fs::write(payload_src.path().join("bin"), "from-cache").unwrap();
        let cache = Arc::new(gantry_cache::DirCache::new(dir.path().join("cache"), false));
        cache
            .upload(
                &pkg.fingerprint,
                &gantry_cache::pack_compiled(payload_src.path()).unwrap(),
            )
            .unwrap();

        let (backend, compilator) = test_compilator(dir.path());
        let compilator = compilator.with_cache(cache as Arc<dyn PackageCache>);
        compilator.compile(1, &releases, None).unwrap();

        assert!(backend.runs().is_empty(), "cache hit must not compile");
        let compiled = compilator.store().compiled_dir(&pkg.name, &pkg.fingerprint);
        assert_eq!(
            std::fs::read_to_string(compiled.join("bin")).unwrap(),
            "from-cache"
        );
    }

    #[test]
    fn cache_miss_compiles_and_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let release = ReleaseBuilder::new("demo", "1")
            .package("fresh", &[])
            .build(dir.path())
            .unwrap();
        let pkg = release.packages[0].clone();
        let releases = vec![release];

        let cache = Arc::new(gantry_cache::DirCache::new(dir.path().join("cache"), false));
        let (backend, compilator) = test_compilator(dir.path());
        let compilator = compilator.with_cache(Arc::clone(&cache) as Arc<dyn PackageCache>);
        compilator.compile(1, &releases, None).unwrap();

        assert_eq!(backend.runs().len(), 1);
        assert!(cache.exists(&pkg.fingerprint).unwrap());
    }

    #[test]
    fn read_only_cache_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let release = ReleaseBuilder::new("demo", "1")
            .package("fresh", &[])
            .build(dir.path())
            .unwrap();
        let pkg = release.packages[0].clone();
        let releases = vec![release];

        let cache = Arc::new(gantry_cache::DirCache::new(dir.path().join("cache"), true));
        let (_backend, compilator) = test_compilator(dir.path());
        let compilator = compilator.with_cache(Arc::clone(&cache) as Arc<dyn PackageCache>);
        compilator.compile(1, &releases, None).unwrap();

        assert!(!cache.exists(&pkg.fingerprint).unwrap());
    }

    #[test]
    fn metrics_record_wait_and_run_phases() {
        let dir = tempfile::tempdir().unwrap();
        let releases = vec![compiled_release(dir.path())];
        let metrics_path = dir.path().join("metrics.csv");
        let (_backend, compilator) = test_compilator(dir.path());
        let compilator = compilator.with_metrics(Metrics::new(&metrics_path));

        compilator.compile(2, &releases, None).unwrap();

        let contents = std::fs::read_to_string(&metrics_path).unwrap();
        assert!(contents.contains(",gantry,compile-packages,start"));
        assert!(contents.contains(",gantry,compile-packages,done"));
        assert!(contents.contains("compile-packages::wait::demo/app,start"));
        assert!(contents.contains("compile-packages::run::demo/app,done"));
    }

    #[test]
    fn grapher_sees_the_input_dag() {
        let dir = tempfile::tempdir().unwrap();
        let releases = vec![compiled_release(dir.path())];
        let grapher = Arc::new(crate::GraphWriter::new());
        let (_backend, compilator) = test_compilator(dir.path());
        let compilator = compilator.with_grapher(Arc::clone(&grapher) as Arc<dyn ModelGrapher>);

        compilator.compile(2, &releases, None).unwrap();

        let out = dir.path().join("graph.txt");
        grapher.write_to(&out).unwrap();
        let text = std::fs::read_to_string(&out).unwrap();
        let base = &releases[0].lookup_package("base").unwrap().fingerprint;
        let lib = &releases[0].lookup_package("lib").unwrap().fingerprint;
        assert!(text.contains(&format!("edge {base} {lib}")));
    }
}
