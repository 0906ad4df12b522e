use std::env;
use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};
use serde::{Deserialize, Serialize};

use crate::utils;

/// Environment slot carrying the serialized descriptor into the re-exec'd
/// init process.
pub const OVERLAYFS_ENV: &str = "RUNJ_OVERLAYFS";

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("bad permissions on {dir}: {source}")]
    Permissions {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("the work directory {0} is not empty")]
    WorkdirNotEmpty(PathBuf),
    #[error("error inspecting {dir}")]
    Io {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error deserializing the overlayfs descriptor")]
    Descriptor(#[source] serde_json::Error),
    #[error("error creating the overlayfs mount on {dir}: {source}")]
    Mount {
        dir: PathBuf,
        #[source]
        source: nix::Error,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OverlayfsConfig {
    pub lower_dir: PathBuf,
    pub upper_dir: PathBuf,
    pub work_dir: PathBuf,
    pub merged_dir: PathBuf,
}

/// Host-side validation, run before the container is created. The mount
/// itself happens inside the namespaces, see `mount_from_env`.
pub fn check(config: &OverlayfsConfig) -> Result<(), OverlayError> {
    // The container user reaches the layers through the "other" permission
    // class once the id mappings are in place.
    check_permission(&config.lower_dir, 0o005)?;
    check_permission(&config.upper_dir, 0o007)?;
    check_permission(&config.merged_dir, 0o700)?;

    let empty = utils::directory_empty(&config.work_dir)
        .map_err(|source| OverlayError::Io { dir: config.work_dir.clone(), source })?;
    if !empty {
        return Err(OverlayError::WorkdirNotEmpty(config.work_dir.clone()));
    }

    Ok(())
}

fn check_permission(dir: &Path, bits: u32) -> Result<(), OverlayError> {
    utils::check_permission(dir, bits)
        .map_err(|source| OverlayError::Permissions { dir: dir.to_path_buf(), source })
}

/// Serializes the descriptor into the environment so it survives the re-exec
/// of the trampoline.
pub fn publish_to_env(config: &OverlayfsConfig) {
    let descriptor = serde_json::to_string(config).expect("overlayfs descriptor is serializable");
    env::set_var(OVERLAYFS_ENV, descriptor);
}

/// Mounts the overlay from the environment descriptor. Called by the
/// trampoline after the mount namespace has been unshared and propagation
/// made private; a missing descriptor means the job runs on a plain rootfs.
pub fn mount_from_env() -> Result<(), OverlayError> {
    let descriptor = match env::var(OVERLAYFS_ENV) {
        Ok(value) if !value.is_empty() => value,
        _ => return Ok(()),
    };

    let config: OverlayfsConfig =
        serde_json::from_str(&descriptor).map_err(OverlayError::Descriptor)?;

    let options = mount_options(&config);
    mount(
        Some("overlay"),
        &config.merged_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|source| OverlayError::Mount { dir: config.merged_dir.clone(), source })?;

    Ok(())
}

// * `userxattr` is required for overlayfs inside a user namespace. tmpfs
//   upperdirs will still fail with 'failed to set xattr on upper' since tmpfs
//   has no user xattr support.
// * `xino=off` avoids 'filesystem does not support file handles' when
//   CAP_DAC_READ_SEARCH is absent.
// * `index=off` matches the common container-runtime default.
fn mount_options(config: &OverlayfsConfig) -> String {
    format!(
        "userxattr,xino=off,index=off,lowerdir={},upperdir={},workdir={}",
        config.lower_dir.display(),
        config.upper_dir.display(),
        config.work_dir.display()
    )
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn overlay_under(root: &Path) -> OverlayfsConfig {
        let config = OverlayfsConfig {
            lower_dir: root.join("lower"),
            upper_dir: root.join("upper"),
            work_dir: root.join("work"),
            merged_dir: root.join("merged"),
        };
        fs::create_dir(&config.lower_dir).unwrap();
        fs::create_dir(&config.upper_dir).unwrap();
        fs::create_dir(&config.work_dir).unwrap();
        fs::create_dir(&config.merged_dir).unwrap();
        fs::set_permissions(&config.lower_dir, fs::Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(&config.upper_dir, fs::Permissions::from_mode(0o777)).unwrap();
        config
    }

    #[test]
    fn test_mount_options() {
        let config = OverlayfsConfig {
            lower_dir: "/l".into(),
            upper_dir: "/u".into(),
            work_dir: "/w".into(),
            merged_dir: "/m".into(),
        };
        assert_eq!(
            mount_options(&config),
            "userxattr,xino=off,index=off,lowerdir=/l,upperdir=/u,workdir=/w"
        );
    }

    #[test]
    fn test_check_accepts_valid_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = overlay_under(dir.path());
        check(&config).unwrap();
    }

    #[test]
    fn test_check_rejects_dirty_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let config = overlay_under(dir.path());
        fs::write(config.work_dir.join("leftover"), b"x").unwrap();
        assert!(matches!(check(&config), Err(OverlayError::WorkdirNotEmpty(_))));
    }

    #[test]
    fn test_check_rejects_unreadable_lower() {
        let dir = tempfile::tempdir().unwrap();
        let config = overlay_under(dir.path());
        fs::set_permissions(&config.lower_dir, fs::Permissions::from_mode(0o700)).unwrap();
        assert!(matches!(check(&config), Err(OverlayError::Permissions { .. })));
    }
}
