//! Concurrent package compilation for gantry.
//!
//! The engine takes the packages needed by the selected instance groups,
//! deduplicates them by source fingerprint, orders them topologically, and
//! drives a pool of worker threads that compile each package inside a
//! stemcell container once every dependency has succeeded. Results stream
//! back to a synchronizer which unblocks dependents and, on the first
//! failure, broadcasts a kill signal; the run always drains to completion so
//! no worker is leaked.

pub mod buckets;
pub mod compilator;
pub mod graph;
pub mod metrics;
pub mod signal;

pub use buckets::create_dep_buckets;
pub use compilator::{Compilator, NullLog, ProgressLog, ProgressState};
pub use graph::{GraphWriter, ModelGrapher};
pub use metrics::Metrics;
pub use signal::Signal;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("model error: {0}")]
    Model(#[from] gantry_model::ModelError),
    #[error("store error: {0}")]
    Store(#[from] gantry_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] gantry_runtime::RuntimeError),
    #[error("cache error: {0}")]
    Cache(#[from] gantry_cache::CacheError),
    #[error("worker aborted")]
    Aborted,
    #[error("error compiling package {package}: {detail}")]
    CompilationFailed { package: String, detail: String },
    #[error("dependency cycle among packages: {0:?}")]
    DependencyCycle(Vec<String>),
    #[error("compile result channel closed early")]
    ResultChannelClosed,
}
