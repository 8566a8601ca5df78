//! Object model for gantry: releases, jobs, packages, role manifests.
//!
//! The model is built in two phases. Loading parses release metadata and the
//! role manifest into an unresolved graph; resolution binds job references to
//! release jobs, aggregates per-instance-group run settings, wires links
//! between providers and consumers, and validates the whole deployment,
//! accumulating diagnostics instead of stopping at the first problem.
//! After resolution the model is immutable apart from the back-edges the
//! resolver itself wrote.
//!
//! The crate also owns the deterministic fingerprint primitives used for
//! package deduplication and image tagging, and the light/dark opinions
//! merger that computes each job's effective runtime properties.

pub mod fingerprint;
pub mod fixtures;
pub mod job;
pub mod manifest;
pub mod opinions;
pub mod package;
pub mod release;
pub mod resolver;
pub mod run;
pub mod validation;

pub use fingerprint::{aggregate_signatures, role_dev_version, role_job_and_packages_signature};
pub use job::{ConsumedLink, Job, JobProperty, JobTemplate, LinkInfo, ProvidedLink};
pub use manifest::{
    AuthAccount, AuthRule, Authorization, Configuration, ConsumeOverride, Containerization,
    GroupTag, GroupType, InstanceGroup, JobReference, ProvideOverride, RoleManifest, TemplateDef,
    Variable, VariableOptions,
};
pub use opinions::{flatten, properties_for_job, Opinions};
pub use package::{Package, PackageRef};
pub use release::{Release, ReleaseKind, ReleaseRef};
pub use resolver::{calculate_role_run, kebab, resolve, resolve_links};
pub use run::{HealthCheck, HealthProbe, PortDef, RoleRun, RunScaling, RunVolume};
pub use validation::{ErrorKind, ErrorList, ValidationError};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] gantry_store::StoreError),
    #[error("error loading release {release} from {path}: {reason}")]
    ReleaseLoad {
        release: String,
        path: PathBuf,
        reason: String,
    },
    #[error("error loading role manifest {path}: {reason}")]
    ManifestLoad { path: PathBuf, reason: String },
    #[error("release {0} was loaded more than once")]
    DuplicateRelease(String),
    #[error("no instance group named {0}")]
    GroupNotFound(String),
    #[error("opinions document has no 'properties' key in its {0} half")]
    OpinionsFormat(&'static str),
    #[error("property {property}: cannot extend non-map value at {segment}")]
    PropertyConflict { property: String, segment: String },
    #[error("{0}")]
    Validation(ErrorList),
}
