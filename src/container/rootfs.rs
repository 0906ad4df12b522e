use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, pivot_root};
use oci_spec::runtime::{Mount as SpecMount, Spec};

#[derive(Debug, thiserror::Error)]
pub enum RootfsError {
    #[error("the spec carries no root path")]
    NoRoot,
    #[error("failed to mount {target}")]
    Mount {
        target: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("{operation} failed")]
    Syscall {
        operation: &'static str,
        #[source]
        source: nix::Error,
    },
    #[error("failed to prepare {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, RootfsError>;

/// Devices made available through bind mounts; mknod is out of reach inside
/// a user namespace.
const DEFAULT_DEVICES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty"];

const DEFAULT_SYMLINKS: &[(&str, &str)] = &[
    ("/proc/self/fd", "dev/fd"),
    ("/proc/self/fd/0", "dev/stdin"),
    ("/proc/self/fd/1", "dev/stdout"),
    ("/proc/self/fd/2", "dev/stderr"),
    ("pts/ptmx", "dev/ptmx"),
];

/// Flips the propagation of the inherited tree to private so nothing the
/// container assembles travels back to the host. Must run right after the
/// mount namespace is unshared, before the first mount.
pub fn make_propagation_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|source| RootfsError::Syscall { operation: "remount / as private", source })
}

/// Assembles the container filesystem: the mount table from the spec, the
/// device nodes and symlinks below /dev, the root switch and finally the
/// masked and readonly paths.
pub fn prepare(spec: &Spec) -> Result<()> {
    let root = spec
        .root()
        .as_ref()
        .map(|root| root.path().clone())
        .ok_or(RootfsError::NoRoot)?;

    // pivot_root refuses a plain directory, bind the root over itself.
    mount(
        Some(&root),
        &root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|source| RootfsError::Mount { target: root.clone(), source })?;

    if let Some(mounts) = spec.mounts().as_ref() {
        for entry in mounts {
            mount_into_container(&root, entry)?;
        }
    }

    setup_devices(&root)?;
    setup_default_symlinks(&root)?;

    pivot(&root)?;

    if let Some(linux) = spec.linux().as_ref() {
        if let Some(paths) = linux.masked_paths().as_ref() {
            for path in paths {
                mask_path(Path::new(path))?;
            }
        }

        if let Some(paths) = linux.readonly_paths().as_ref() {
            for path in paths {
                readonly_path(Path::new(path))?;
            }
        }
    }

    Ok(())
}

fn mount_into_container(root: &Path, entry: &SpecMount) -> Result<()> {
    let destination = entry.destination();
    let target = root.join(destination.strip_prefix("/").unwrap_or(destination));

    let options = entry.options().clone().unwrap_or_default();
    let parsed = parse_mount_options(&options);

    let source = entry.source().clone().unwrap_or_else(|| PathBuf::from("none"));
    let fstype = entry.typ().clone().unwrap_or_else(|| "none".to_string());

    if parsed.flags.contains(MsFlags::MS_BIND) && source.is_file() {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| RootfsError::Io { path: target.clone(), source })?;
        }
        if !target.exists() {
            fs::File::create(&target)
                .map_err(|source| RootfsError::Io { path: target.clone(), source })?;
        }
    } else {
        fs::create_dir_all(&target)
            .map_err(|source| RootfsError::Io { path: target.clone(), source })?;
    }

    let data = parsed.data.join(",");
    let data = if data.is_empty() { None } else { Some(data.as_str()) };

    mount(Some(&source), &target, Some(fstype.as_str()), parsed.flags, data)
        .map_err(|source| RootfsError::Mount { target: target.clone(), source })?;

    // A read-only bind only takes effect on a remount pass.
    if parsed.flags.contains(MsFlags::MS_BIND) && parsed.flags.contains(MsFlags::MS_RDONLY) {
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            parsed.flags | MsFlags::MS_REMOUNT,
            None::<&str>,
        )
        .map_err(|source| RootfsError::Mount { target: target.clone(), source })?;
    }

    if let Some(propagation) = parsed.propagation {
        mount(None::<&str>, &target, None::<&str>, propagation, None::<&str>)
            .map_err(|source| RootfsError::Mount { target: target.clone(), source })?;
    }

    Ok(())
}

#[derive(Debug, PartialEq)]
struct MountOptionConfig {
    flags: MsFlags,
    data: Vec<String>,
    propagation: Option<MsFlags>,
}

impl Default for MountOptionConfig {
    fn default() -> Self {
        MountOptionConfig { flags: MsFlags::empty(), data: Vec::default(), propagation: None }
    }
}

fn parse_mount_options(options: &[String]) -> MountOptionConfig {
    let mut config = MountOptionConfig { flags: MsFlags::empty(), ..Default::default() };

    for option in options {
        match option.as_str() {
            "ro" => config.flags |= MsFlags::MS_RDONLY,
            "rw" => config.flags &= !MsFlags::MS_RDONLY,
            "nosuid" => config.flags |= MsFlags::MS_NOSUID,
            "suid" => config.flags &= !MsFlags::MS_NOSUID,
            "nodev" => config.flags |= MsFlags::MS_NODEV,
            "dev" => config.flags &= !MsFlags::MS_NODEV,
            "noexec" => config.flags |= MsFlags::MS_NOEXEC,
            "exec" => config.flags &= !MsFlags::MS_NOEXEC,
            "noatime" => config.flags |= MsFlags::MS_NOATIME,
            "relatime" => config.flags |= MsFlags::MS_RELATIME,
            "strictatime" => config.flags |= MsFlags::MS_STRICTATIME,
            "bind" => config.flags |= MsFlags::MS_BIND,
            "rbind" => config.flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "private" => config.propagation = Some(MsFlags::MS_PRIVATE),
            "rprivate" => config.propagation = Some(MsFlags::MS_PRIVATE | MsFlags::MS_REC),
            "slave" => config.propagation = Some(MsFlags::MS_SLAVE),
            "rslave" => config.propagation = Some(MsFlags::MS_SLAVE | MsFlags::MS_REC),
            "shared" => config.propagation = Some(MsFlags::MS_SHARED),
            "rshared" => config.propagation = Some(MsFlags::MS_SHARED | MsFlags::MS_REC),
            other => config.data.push(other.to_string()),
        }
    }

    config
}

fn setup_devices(root: &Path) -> Result<()> {
    for device in DEFAULT_DEVICES {
        let host = Path::new("/dev").join(device);
        if !host.exists() {
            continue;
        }

        let target = root.join("dev").join(device);
        if !target.exists() {
            fs::File::create(&target)
                .map_err(|source| RootfsError::Io { path: target.clone(), source })?;
        }

        mount(Some(&host), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
            .map_err(|source| RootfsError::Mount { target: target.clone(), source })?;
    }

    Ok(())
}

fn setup_default_symlinks(root: &Path) -> Result<()> {
    for (original, link) in DEFAULT_SYMLINKS {
        let link = root.join(link);
        match symlink(original, &link) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(source) => return Err(RootfsError::Io { path: link, source }),
        }
    }

    Ok(())
}

/// The classic same-directory pivot: after pivot_root(".", ".") the old
/// root sits stacked on the new one and a lazy unmount peels it off.
fn pivot(root: &Path) -> Result<()> {
    chdir(root).map_err(|source| RootfsError::Syscall { operation: "chdir(new root)", source })?;
    pivot_root(".", ".")
        .map_err(|source| RootfsError::Syscall { operation: "pivot_root", source })?;
    umount2(".", MntFlags::MNT_DETACH)
        .map_err(|source| RootfsError::Syscall { operation: "umount(old root)", source })?;
    chdir("/").map_err(|source| RootfsError::Syscall { operation: "chdir(/)", source })?;

    Ok(())
}

/// Hides a host-derived path: files disappear behind /dev/null, directories
/// behind an empty read-only tmpfs. Paths the rootfs does not carry are
/// skipped.
fn mask_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RootfsError::Io { path: path.to_path_buf(), source }),
        Ok(metadata) if metadata.is_dir() => mount(
            Some("tmpfs"),
            path,
            Some("tmpfs"),
            MsFlags::MS_RDONLY,
            Some("size=0k"),
        )
        .map_err(|source| RootfsError::Mount { target: path.to_path_buf(), source }),
        Ok(_) => mount(
            Some("/dev/null"),
            path,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|source| RootfsError::Mount { target: path.to_path_buf(), source }),
    }
}

fn readonly_path(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    mount(
        Some(path),
        path,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|source| RootfsError::Mount { target: path.to_path_buf(), source })?;

    mount(
        None::<&str>,
        path,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|source| RootfsError::Mount { target: path.to_path_buf(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(list: &[&str]) -> Vec<String> {
        list.iter().map(|option| option.to_string()).collect()
    }

    #[test]
    fn test_parse_mount_options() {
        let parsed = parse_mount_options(&options(&["rbind", "private", "ro"]));
        assert!(parsed.flags.contains(MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_RDONLY));
        assert_eq!(parsed.propagation, Some(MsFlags::MS_PRIVATE));
        assert!(parsed.data.is_empty());

        let parsed =
            parse_mount_options(&options(&["nosuid", "noexec", "mode=755", "size=65536k"]));
        assert!(parsed.flags.contains(MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC));
        assert_eq!(parsed.data, vec!["mode=755", "size=65536k"]);
    }

    #[test]
    fn test_parse_mount_options_clears_flags() {
        let parsed = parse_mount_options(&options(&["bind", "noexec", "exec"]));
        assert!(parsed.flags.contains(MsFlags::MS_BIND));
        assert!(!parsed.flags.contains(MsFlags::MS_NOEXEC));
    }
}
