//! Archive handling and the compiled-package store for gantry.
//!
//! This crate provides the storage layer shared by the release loader and the
//! compilation engine: streaming SHA-1 digests and verification of release
//! archives, `.tgz` extraction, deterministic tar packing for cache transport,
//! and `CompiledStore` — the on-disk layout holding one directory per
//! `(package, fingerprint)` with an atomically-finalized `compiled/` output.

pub mod archive;
pub mod layout;

pub use archive::{append_dir_sorted, extract_tgz, file_sha1, pack_dir, unpack_tar, verify_sha1};
pub use layout::{copy_tree, CompiledStore};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive not found: {0}")]
    ArchiveMissing(PathBuf),
    #[error("digest mismatch for {path}: computed sha1 {actual}, manifest says {expected}")]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("path {path} ({description}) should be a {expected}")]
    WrongPathKind {
        path: PathBuf,
        description: &'static str,
        expected: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_mismatch_names_both_digests() {
        let e = StoreError::DigestMismatch {
            path: PathBuf::from("/tmp/pkg.tgz"),
            expected: "aaaa".to_owned(),
            actual: "bbbb".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("aaaa"));
        assert!(msg.contains("bbbb"));
        assert!(msg.contains("pkg.tgz"));
    }

    #[test]
    fn archive_missing_names_path() {
        let e = StoreError::ArchiveMissing(PathBuf::from("/nowhere/x.tgz"));
        assert!(e.to_string().contains("/nowhere/x.tgz"));
    }
}
