use crate::StoreError;
use flate2::read::GzDecoder;
use sha1::{Digest, Sha1};
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Compute the hex SHA-1 of a file, streaming in 64 KiB chunks.
pub fn file_sha1(path: &Path) -> Result<String, StoreError> {
    let file = fs::File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StoreError::ArchiveMissing(path.to_path_buf())
        } else {
            StoreError::Io(e)
        }
    })?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Verify that a file's SHA-1 matches the digest declared by a release
/// manifest. Mismatch is fatal: the archive is not what the release built.
pub fn verify_sha1(path: &Path, expected: &str) -> Result<(), StoreError> {
    let actual = file_sha1(path)?;
    if actual != expected {
        return Err(StoreError::DigestMismatch {
            path: path.to_path_buf(),
            expected: expected.to_owned(),
            actual,
        });
    }
    Ok(())
}

/// Extract a gzip-compressed tar archive into `dest`, creating it if needed.
pub fn extract_tgz(archive: &Path, dest: &Path) -> Result<(), StoreError> {
    let file = fs::File::open(archive).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StoreError::ArchiveMissing(archive.to_path_buf())
        } else {
            StoreError::Io(e)
        }
    })?;
    let gz = GzDecoder::new(BufReader::new(file));
    let mut ar = tar::Archive::new(gz);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    fs::create_dir_all(dest)?;
    ar.unpack(dest)?;
    Ok(())
}

/// Create a deterministic tar archive from a directory.
///
/// Used for cache transport and image contexts. Determinism guarantees:
/// entries sorted lexicographically by relative path, timestamps zeroed,
/// ownership 0:0, permissions preserved.
pub fn pack_dir(source_dir: &Path) -> Result<Vec<u8>, StoreError> {
    let mut ar = tar::Builder::new(Vec::new());
    ar.follow_symlinks(false);
    append_dir_sorted(&mut ar, source_dir, "")?;
    Ok(ar.into_inner()?)
}

/// Extract a plain (uncompressed) tar archive into `dest`.
pub fn unpack_tar(data: &[u8], dest: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dest)?;
    let mut ar = tar::Archive::new(data);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.unpack(dest)?;
    Ok(())
}

/// Append a directory tree to a tar builder under `prefix`, sorted for
/// determinism. Exposed so the image emitter can compose several package
/// trees into one archive.
pub fn append_dir_sorted<W: std::io::Write>(
    ar: &mut tar::Builder<W>,
    source_dir: &Path,
    prefix: &str,
) -> Result<(), StoreError> {
    let mut entries = collect_entries(source_dir, source_dir)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    for (rel, full) in &entries {
        let name = if prefix.is_empty() {
            rel.clone()
        } else {
            format!("{}/{}", prefix.trim_end_matches('/'), rel)
        };
        let ft = match full.symlink_metadata() {
            Ok(m) => m.file_type(),
            Err(e) => {
                warn!("skipping {rel}: metadata error: {e}");
                continue;
            }
        };
        if ft.is_file() {
            let data = fs::read(full)?;
            let mut header = make_header(full, tar::EntryType::Regular)?;
            header.set_size(data.len() as u64);
            header.set_cksum();
            ar.append_data(&mut header, &name, data.as_slice())?;
        } else if ft.is_dir() {
            let mut header = make_header(full, tar::EntryType::Directory)?;
            header.set_size(0);
            header.set_cksum();
            ar.append_data(&mut header, format!("{name}/"), &[] as &[u8])?;
        } else if ft.is_symlink() {
            let target = fs::read_link(full)?;
            let mut header = make_header(full, tar::EntryType::Symlink)?;
            header.set_size(0);
            header.set_cksum();
            ar.append_link(&mut header, &name, &target)?;
        } else {
            warn!("skipping unsupported file type: {rel}");
        }
    }
    Ok(())
}

fn make_header(full_path: &Path, entry_type: tar::EntryType) -> Result<tar::Header, StoreError> {
    use std::os::unix::fs::PermissionsExt;
    let meta = full_path.symlink_metadata()?;
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(meta.permissions().mode());
    Ok(header)
}

fn collect_entries(root: &Path, current: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
    let mut result = Vec::new();
    if !current.exists() {
        return Ok(result);
    }
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let full = entry.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| StoreError::Io(std::io::Error::other(format!("path strip: {e}"))))?
            .to_string_lossy()
            .to_string();

        let meta = full.symlink_metadata()?;
        if meta.is_dir() {
            result.push((rel.clone(), full.clone()));
            result.extend(collect_entries(root, &full)?);
        } else {
            result.push((rel, full));
        }
    }
    Ok(result)
}
