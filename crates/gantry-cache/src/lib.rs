//! Compiled-package cache for gantry.
//!
//! A cache maps package fingerprints to compiled-output archives so a
//! package compiled once — anywhere — never needs compiling again. The
//! `PackageCache` trait is the contract the compilation engine programs
//! against; `DirCache` is the local directory implementation used for tests
//! and air-gapped installs.

pub mod dir;

pub use dir::{pack_compiled, unpack_compiled, DirCache};

use thiserror::Error;

/// Progress value passed to download callbacks when the transfer finished.
pub const PROGRESS_DONE: f64 = -1.0;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] gantry_store::StoreError),
    #[error("fingerprint not cached: {0}")]
    NotCached(String),
    #[error("cache is read-only")]
    ReadOnly,
}

/// A store of compiled package output keyed by source fingerprint.
///
/// `download` reports progress as a percentage in steps of at most 5%, then
/// [`PROGRESS_DONE`] once the payload is complete.
pub trait PackageCache: Send + Sync {
    fn exists(&self, fingerprint: &str) -> Result<bool, CacheError>;

    fn download(
        &self,
        fingerprint: &str,
        progress: &mut dyn FnMut(f64),
    ) -> Result<Vec<u8>, CacheError>;

    fn upload(&self, fingerprint: &str, data: &[u8]) -> Result<(), CacheError>;

    fn read_only(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_cached_names_fingerprint() {
        let e = CacheError::NotCached("f00d".to_owned());
        assert!(e.to_string().contains("f00d"));
    }
}
