use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk store of compiled package output, rooted at a work directory.
///
/// One directory per `(package name, fingerprint)` pair:
///
/// ```text
/// <root>/<pkg-name>/<fingerprint>/
///   sources/var/vcap/source/     extracted package sources
///   sources/var/vcap/packages/   compiled dependencies, copied in
///   compiled-temp/               build output while in flight
///   compiled/                    renamed from compiled-temp on success
/// ```
///
/// The rename is the commit point: a package counts as compiled exactly when
/// `compiled/` exists and is non-empty, so a crashed build never looks done.
#[derive(Debug, Clone)]
pub struct CompiledStore {
    root: PathBuf,
}

impl CompiledStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn package_dir(&self, name: &str, fingerprint: &str) -> PathBuf {
        self.root.join(name).join(fingerprint)
    }

    #[inline]
    pub fn sources_dir(&self, name: &str, fingerprint: &str) -> PathBuf {
        self.package_dir(name, fingerprint).join("sources")
    }

    /// Where package sources are extracted before the build runs.
    #[inline]
    pub fn source_dir(&self, name: &str, fingerprint: &str) -> PathBuf {
        self.sources_dir(name, fingerprint)
            .join("var")
            .join("vcap")
            .join("source")
    }

    /// Where compiled dependencies are copied so the build can link against them.
    #[inline]
    pub fn dependencies_dir(&self, name: &str, fingerprint: &str) -> PathBuf {
        self.sources_dir(name, fingerprint)
            .join("var")
            .join("vcap")
            .join("packages")
    }

    #[inline]
    pub fn compiled_temp_dir(&self, name: &str, fingerprint: &str) -> PathBuf {
        self.package_dir(name, fingerprint).join("compiled-temp")
    }

    #[inline]
    pub fn compiled_dir(&self, name: &str, fingerprint: &str) -> PathBuf {
        self.package_dir(name, fingerprint).join("compiled")
    }

    /// Create the directory skeleton for a package build.
    pub fn prepare(&self, name: &str, fingerprint: &str) -> Result<(), StoreError> {
        fs::create_dir_all(self.source_dir(name, fingerprint))?;
        fs::create_dir_all(self.dependencies_dir(name, fingerprint))?;
        fs::create_dir_all(self.compiled_temp_dir(name, fingerprint))?;
        Ok(())
    }

    /// A package is compiled when its `compiled/` directory exists, is a
    /// directory, and holds at least one entry.
    pub fn is_compiled(&self, name: &str, fingerprint: &str) -> Result<bool, StoreError> {
        let compiled = self.compiled_dir(name, fingerprint);
        match fs::metadata(&compiled) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
            Ok(meta) if !meta.is_dir() => {
                return Err(StoreError::WrongPathKind {
                    path: compiled,
                    description: "compiled package output",
                    expected: "directory",
                })
            }
            Ok(_) => {}
        }
        Ok(fs::read_dir(&compiled)?.next().is_some())
    }

    /// Atomically promote `compiled-temp/` to `compiled/`.
    pub fn finalize(&self, name: &str, fingerprint: &str) -> Result<(), StoreError> {
        fs::rename(
            self.compiled_temp_dir(name, fingerprint),
            self.compiled_dir(name, fingerprint),
        )?;
        Ok(())
    }

    /// Copy a dependency's compiled output into a package's build inputs,
    /// replacing any stale copy from an earlier attempt.
    pub fn copy_dependency(
        &self,
        pkg_name: &str,
        pkg_fingerprint: &str,
        dep_name: &str,
        dep_fingerprint: &str,
    ) -> Result<(), StoreError> {
        let src = self.compiled_dir(dep_name, dep_fingerprint);
        let dest = self
            .dependencies_dir(pkg_name, pkg_fingerprint)
            .join(dep_name);
        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        copy_tree(&src, &dest)
    }
}

/// Recursively copy a directory tree, preserving symlinks as symlinks.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let ft = entry.path().symlink_metadata()?.file_type();
        if ft.is_dir() {
            copy_tree(&from, &to)?;
        } else if ft.is_symlink() {
            let target = fs::read_link(&from)?;
            std::os::unix::fs::symlink(target, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = CompiledStore::new("/work/compilation");
        assert_eq!(
            store.package_dir("nats", "f1"),
            PathBuf::from("/work/compilation/nats/f1")
        );
        assert_eq!(
            store.source_dir("nats", "f1"),
            PathBuf::from("/work/compilation/nats/f1/sources/var/vcap/source")
        );
        assert_eq!(
            store.dependencies_dir("nats", "f1"),
            PathBuf::from("/work/compilation/nats/f1/sources/var/vcap/packages")
        );
        assert_eq!(
            store.compiled_dir("nats", "f1"),
            PathBuf::from("/work/compilation/nats/f1/compiled")
        );
    }

    #[test]
    fn not_compiled_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CompiledStore::new(dir.path());
        assert!(!store.is_compiled("nats", "f1").unwrap());
    }

    #[test]
    fn empty_compiled_dir_does_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = CompiledStore::new(dir.path());
        fs::create_dir_all(store.compiled_dir("nats", "f1")).unwrap();
        assert!(!store.is_compiled("nats", "f1").unwrap());
    }

    #[test]
    fn finalize_promotes_temp_output() {
        let dir = tempfile::tempdir().unwrap();
        let store = CompiledStore::new(dir.path());
        store.prepare("nats", "f1").unwrap();
        fs::write(store.compiled_temp_dir("nats", "f1").join("bin"), "x").unwrap();

        store.finalize("nats", "f1").unwrap();
        assert!(store.is_compiled("nats", "f1").unwrap());
        assert!(!store.compiled_temp_dir("nats", "f1").exists());
    }

    #[test]
    fn copy_dependency_replaces_stale_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = CompiledStore::new(dir.path());

        fs::create_dir_all(store.compiled_dir("dep", "fd")).unwrap();
        fs::write(store.compiled_dir("dep", "fd").join("lib.so"), "new").unwrap();

        store.prepare("pkg", "fp").unwrap();
        let stale = store.dependencies_dir("pkg", "fp").join("dep");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("old"), "old").unwrap();

        store.copy_dependency("pkg", "fp", "dep", "fd").unwrap();
        let copied = store.dependencies_dir("pkg", "fp").join("dep");
        assert!(copied.join("lib.so").exists());
        assert!(!copied.join("old").exists());
    }

    #[test]
    fn copy_tree_preserves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("real"), "data").unwrap();
        std::os::unix::fs::symlink("real", src.join("link")).unwrap();

        let dest = dir.path().join("dest");
        copy_tree(&src, &dest).unwrap();
        assert!(dest
            .join("link")
            .symlink_metadata()
            .unwrap()
            .file_type()
            .is_symlink());
    }
}
