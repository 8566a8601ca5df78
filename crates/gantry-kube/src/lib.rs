//! Image and chart emission for gantry.
//!
//! Consumes the resolved role manifest and the compiled-package store and
//! produces the deployable artifacts: the packages layer image (union of
//! all compiled packages), one image per instance group tagged by its dev
//! version, and Kubernetes deployment descriptors — concrete YAML or a
//! helm-templated chart.

pub mod chart;
pub mod images;
pub mod rbac;
pub mod secret;
pub mod service;
pub mod workload;

pub use chart::write_deployment;
pub use images::{
    collect_packages, role_dev_versions, role_image_name, PackagesImageBuilder, RoleImageBuilder,
};
pub use rbac::new_rbac_list;
pub use secret::new_secret;
pub use service::new_service_list;
pub use workload::new_workload;

use thiserror::Error;

/// Settings shared by every emitter.
#[derive(Debug, Clone, Default)]
pub struct ExportSettings {
    /// Image name prefix, e.g. `gantry`.
    pub repository: String,
    /// Registry host, prepended to image names when set.
    pub registry: String,
    /// Registry organization, prepended to image names when set.
    pub organization: String,
    /// Emit a helm-templated chart instead of concrete YAML.
    pub helm_chart: bool,
    pub tag_extra: String,
    pub tool_version: String,
    pub force: bool,
    pub no_build: bool,
}

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("model error: {0}")]
    Model(#[from] gantry_model::ModelError),
    #[error("store error: {0}")]
    Store(#[from] gantry_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] gantry_runtime::RuntimeError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),
    #[error("instance group {0} has no aggregated run block; resolve the manifest first")]
    MissingRun(String),
    #[error("package {name} ({fingerprint}) is not in the compiled store")]
    PackageNotCompiled { name: String, fingerprint: String },
}
