//! Container engine contract for gantry.
//!
//! The compilation engine and the image emitter talk to a container engine
//! through the `ContainerBackend` trait: run a command inside an image with
//! directories bind-mounted or streamed, remove containers together with
//! their anonymous volumes, and build/tag images. Two implementations ship
//! here: a `docker`-CLI adapter and a scriptable in-memory mock for tests.
//! The crate also owns container/image naming rules and the embedded
//! per-base-OS compilation scripts.

pub mod backend;
pub mod docker;
pub mod mock;
pub mod naming;
pub mod scripts;

pub use backend::{select_backend, ContainerBackend, LogStream, RunOpts};
pub use docker::DockerCliBackend;
pub use mock::MockBackend;
pub use naming::{compilation_container_name, sanitize_name};
pub use scripts::save_compilation_script;

use thiserror::Error;

/// Path inside the compilation container where build inputs are mounted.
pub const CONTAINER_IN_PATH: &str = "/gantry-in";
/// Path inside the compilation container where build output is collected.
pub const CONTAINER_OUT_PATH: &str = "/gantry-out";
/// Where BOSH-style packaging scripts expect compiled dependencies.
pub const CONTAINER_PACKAGES_DIR: &str = "/var/vcap/packages";
/// Scratch directory for package sources inside the container. Backed by an
/// anonymous volume to avoid overlay filesystem emulation quirks.
pub const CONTAINER_SOURCE_DIR: &str = "/var/vcap/source";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("container engine unavailable: {0}")]
    Unavailable(String),
    #[error("container {name} exited with code {code}")]
    ContainerFailed { name: String, code: i32 },
    #[error("container engine error: {0}")]
    Engine(String),
    #[error("unsupported stemcell base type: {0}")]
    UnsupportedBaseType(String),
}
