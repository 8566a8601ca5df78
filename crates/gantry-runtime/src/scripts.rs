use crate::RuntimeError;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const UBUNTU_SCRIPT: &str = include_str!("../scripts/compile-ubuntu.sh");
const SLE_SCRIPT: &str = include_str!("../scripts/compile-sle.sh");

/// The compilation script for a stemcell base OS type.
pub fn compilation_script(base_type: &str) -> Result<&'static str, RuntimeError> {
    match base_type {
        "ubuntu" => Ok(UBUNTU_SCRIPT),
        "sle" | "opensuse" => Ok(SLE_SCRIPT),
        other => Err(RuntimeError::UnsupportedBaseType(other.to_owned())),
    }
}

/// Write the compilation script for `base_type` to `dest`, executable.
pub fn save_compilation_script(base_type: &str, dest: &Path) -> Result<(), RuntimeError> {
    let script = compilation_script(base_type)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest, script)?;
    fs::set_permissions(dest, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_base_types_have_scripts() {
        assert!(compilation_script("ubuntu").is_ok());
        assert!(compilation_script("sle").is_ok());
        assert!(compilation_script("opensuse").is_ok());
    }

    #[test]
    fn unknown_base_type_is_rejected() {
        let err = compilation_script("plan9").unwrap_err();
        assert!(matches!(err, RuntimeError::UnsupportedBaseType(_)));
    }

    #[test]
    fn saved_script_is_executable() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("compile.sh");
        save_compilation_script("ubuntu", &dest).unwrap();

        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        let content = fs::read_to_string(&dest).unwrap();
        assert!(content.contains("BOSH_INSTALL_TARGET"));
    }
}
