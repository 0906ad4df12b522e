use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::CgroupError;
use crate::utils::RUNJ_INSTANCE_ID;

/// Creates the container cgroup directly below `parent` on the unified
/// hierarchy. Used in containerized environments (e.g. with the help of
/// sysbox) and whenever the job supplies an explicit parent path.
pub fn create_cgroup(parent: &Path) -> Result<PathBuf, CgroupError> {
    let path = parent.join(format!("runj-container-{}", &*RUNJ_INSTANCE_ID));

    DirBuilder::new().recursive(true).mode(0o775).create(&path).map_err(|source| {
        CgroupError::WrappedIo { operation: "create", path: path.clone(), source }
    })?;

    debug!("created cgroup directory {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_cgroup() {
        let dir = tempfile::tempdir().unwrap();

        let path = create_cgroup(dir.path()).unwrap();
        assert!(path.is_dir());

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("runj-container-"));
        assert_eq!(name.len(), "runj-container-".len() + 12);

        // Provisioning twice with the same nonce reuses the directory.
        create_cgroup(dir.path()).unwrap();
    }
}
