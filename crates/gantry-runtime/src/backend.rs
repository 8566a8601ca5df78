use crate::RuntimeError;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Options for one containerized command execution.
///
/// Directories can be attached either as bind mounts (`mounts`) or, when the
/// engine is remote, streamed in before the run and back out after it
/// (`stream_in` / `stream_out`). `volumes` lists anonymous volumes to create
/// for the container; they are removed together with it.
#[derive(Debug, Clone, Default)]
pub struct RunOpts {
    pub container_name: String,
    pub image_name: String,
    pub cmd: Vec<String>,
    /// host directory -> container path
    pub mounts: Vec<(PathBuf, String)>,
    /// anonymous volume mount points inside the container
    pub volumes: Vec<String>,
    /// host directory -> container path, copied in before the command runs
    pub stream_in: Vec<(PathBuf, String)>,
    /// container path -> host directory, copied out after the command exits
    pub stream_out: Vec<(String, PathBuf)>,
    pub keep_container: bool,
    pub network_mode: Option<String>,
}

/// A container engine as the compiler and emitter see it.
///
/// `run_in_container` streams output lines to the caller as they appear and
/// returns the command's exit code; a non-zero code is not an `Err` — failing
/// builds are the caller's domain knowledge, engine trouble is ours.
pub trait ContainerBackend: Send + Sync {
    fn name(&self) -> &str;

    fn has_image(&self, image: &str) -> Result<bool, RuntimeError>;

    fn run_in_container(
        &self,
        opts: &RunOpts,
        log: &mut dyn FnMut(LogStream, &str),
    ) -> Result<i32, RuntimeError>;

    /// Force-remove a container and its anonymous volumes. Removing a
    /// container that does not exist is not an error.
    fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// Build an image from a tar build context and tag it.
    fn build_image(
        &self,
        image: &str,
        labels: &BTreeMap<String, String>,
        context_tar: &[u8],
    ) -> Result<(), RuntimeError>;
}

/// Select a backend by name: `docker` or `mock`.
pub fn select_backend(name: &str) -> Result<Box<dyn ContainerBackend>, RuntimeError> {
    match name {
        "docker" => Ok(Box::new(crate::docker::DockerCliBackend::new())),
        "mock" => Ok(Box::new(crate::mock::MockBackend::new())),
        other => Err(RuntimeError::Unavailable(other.to_owned())),
    }
}
