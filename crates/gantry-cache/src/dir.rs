use crate::{CacheError, PackageCache, PROGRESS_DONE};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Package cache backed by a plain directory: one `<fingerprint>.tar` per
/// entry, written atomically via a sibling temp file.
pub struct DirCache {
    root: PathBuf,
    read_only: bool,
}

impl DirCache {
    pub fn new(root: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            root: root.into(),
            read_only,
        }
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join(format!("{fingerprint}.tar"))
    }
}

impl PackageCache for DirCache {
    fn exists(&self, fingerprint: &str) -> Result<bool, CacheError> {
        Ok(self.entry_path(fingerprint).is_file())
    }

    fn download(
        &self,
        fingerprint: &str,
        progress: &mut dyn FnMut(f64),
    ) -> Result<Vec<u8>, CacheError> {
        let path = self.entry_path(fingerprint);
        if !path.is_file() {
            return Err(CacheError::NotCached(fingerprint.to_owned()));
        }
        use std::io::Read;
        let mut file = fs::File::open(&path)?;
        let total = file.metadata()?.len();
        let mut data = Vec::with_capacity(total as usize);

        // Read in twenty slices so callers see progress in 5% steps.
        let chunk = std::cmp::max(1, (total / 20) as usize);
        let mut buf = vec![0u8; chunk];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            if total > 0 {
                progress(data.len() as f64 / total as f64 * 100.0);
            }
        }
        progress(PROGRESS_DONE);
        debug!("cache hit for {fingerprint}: {} bytes", data.len());
        Ok(data)
    }

    fn upload(&self, fingerprint: &str, data: &[u8]) -> Result<(), CacheError> {
        if self.read_only {
            return Err(CacheError::ReadOnly);
        }
        fs::create_dir_all(&self.root)?;
        let dest = self.entry_path(fingerprint);
        let tmp = self.root.join(format!(".{fingerprint}.tmp"));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &dest)?;
        debug!("cached {fingerprint}: {} bytes", data.len());
        Ok(())
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

/// Pack a compiled directory for upload.
pub fn pack_compiled(compiled_dir: &Path) -> Result<Vec<u8>, CacheError> {
    Ok(gantry_store::pack_dir(compiled_dir)?)
}

/// Unpack a downloaded payload into a compiled directory.
pub fn unpack_compiled(data: &[u8], compiled_dir: &Path) -> Result<(), CacheError> {
    Ok(gantry_store::unpack_tar(data, compiled_dir)?)
}
