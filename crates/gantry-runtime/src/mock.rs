use crate::backend::{ContainerBackend, LogStream, RunOpts};
use crate::RuntimeError;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::{Mutex, MutexGuard};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A recorded container run, for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub container_name: String,
    pub image_name: String,
    pub cmd: Vec<String>,
}

/// In-memory container backend for tests.
///
/// A run "executes" by writing a marker file into the directory mounted (or
/// streamed) at [`crate::CONTAINER_OUT_PATH`], so callers see real build
/// output appear. Failures are scripted per container-name substring.
pub struct MockBackend {
    images: Mutex<BTreeSet<String>>,
    runs: Mutex<Vec<RecordedRun>>,
    removed: Mutex<Vec<String>>,
    built: Mutex<Vec<String>>,
    fail_containers: Mutex<Vec<String>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            images: Mutex::new(BTreeSet::new()),
            runs: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            built: Mutex::new(Vec::new()),
            fail_containers: Mutex::new(Vec::new()),
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image as present in the engine.
    pub fn add_image(&self, image: &str) {
        locked(&self.images).insert(image.to_owned());
    }

    /// Make every run whose container name contains `marker` exit non-zero.
    pub fn fail_containers_matching(&self, marker: &str) {
        locked(&self.fail_containers).push(marker.to_owned());
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        locked(&self.runs).clone()
    }

    pub fn removed_containers(&self) -> Vec<String> {
        locked(&self.removed).clone()
    }

    pub fn built_images(&self) -> Vec<String> {
        locked(&self.built).clone()
    }
}

impl ContainerBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn has_image(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(locked(&self.images).contains(image))
    }

    fn run_in_container(
        &self,
        opts: &RunOpts,
        log: &mut dyn FnMut(LogStream, &str),
    ) -> Result<i32, RuntimeError> {
        locked(&self.runs).push(RecordedRun {
            container_name: opts.container_name.clone(),
            image_name: opts.image_name.clone(),
            cmd: opts.cmd.clone(),
        });

        let should_fail = locked(&self.fail_containers)
            .iter()
            .any(|marker| opts.container_name.contains(marker.as_str()));
        if should_fail {
            log(LogStream::Stderr, "mock: scripted failure");
            return Ok(1);
        }

        log(LogStream::Stdout, "mock: compiling");
        let out_dirs = opts
            .mounts
            .iter()
            .filter(|(_, container)| container == crate::CONTAINER_OUT_PATH)
            .map(|(host, _)| host)
            .chain(
                opts.stream_out
                    .iter()
                    .filter(|(container, _)| container == crate::CONTAINER_OUT_PATH)
                    .map(|(_, host)| host),
            );
        for host in out_dirs {
            fs::create_dir_all(host)?;
            fs::write(host.join("compiled.mock"), &opts.container_name)?;
        }
        Ok(0)
    }

    fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        locked(&self.removed).push(name.to_owned());
        Ok(())
    }

    fn build_image(
        &self,
        image: &str,
        _labels: &BTreeMap<String, String>,
        _context_tar: &[u8],
    ) -> Result<(), RuntimeError> {
        locked(&self.built).push(image.to_owned());
        locked(&self.images).insert(image.to_owned());
        Ok(())
    }
}
