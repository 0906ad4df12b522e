use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::{umask, Mode};
use oci_spec::runtime::{
    LinuxBuilder, LinuxCpuBuilder, LinuxMemoryBuilder, LinuxNamespace, LinuxNamespaceBuilder,
    LinuxNamespaceType, LinuxPidsBuilder, LinuxResources, LinuxResourcesBuilder, Mount,
    MountBuilder, RootBuilder, Spec, SpecBuilder,
};
use oci_spec::OciSpecError;

use crate::config::RunjConfig;
use crate::user_ns::ResolvedIdMaps;
use crate::utils;

pub const CONTAINER_HOSTNAME: &str = "seele";

const DEFAULT_MEMORY_LIMIT_BYTES: i64 = 512 * 1024 * 1024;
const DEFAULT_SWAPPINESS: u64 = 0;
const DEFAULT_PIDS_LIMIT: i64 = 64;

const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/sys/firmware",
    "/proc/scsi",
];

const READONLY_PATHS: &[&str] =
    &["/proc/bus", "/proc/fs", "/proc/irq", "/proc/sys", "/proc/sysrq-trigger"];

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("the mount source does not exist: {0}")]
    MountSourceMissing(PathBuf),
    #[error("failed to resolve the absolute path for {path}")]
    ResolvePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to chmod the mount source {path}")]
    Chmod {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Oci(#[from] OciSpecError),
}

type Result<T> = std::result::Result<T, SpecError>;

/// Builds the canonical container specification: the root, the mount table,
/// the namespace set, the masked and readonly paths, the resource rules and
/// the id mappings.
pub fn make_container_spec(config: &RunjConfig, id_maps: Option<&ResolvedIdMaps>) -> Result<Spec> {
    // Exactly one of the two supplies the root; an overlay root stays
    // writable through its upper layer.
    let root = match (&config.rootfs, &config.overlayfs) {
        (Some(rootfs), _) => RootBuilder::default().path(rootfs.clone()).readonly(true).build()?,
        (None, Some(overlayfs)) => {
            RootBuilder::default().path(overlayfs.merged_dir.clone()).readonly(false).build()?
        }
        (None, None) => unreachable!("validated config supplies a root"),
    };

    let mut mounts = default_mounts()?;
    for mount in &config.mounts {
        mounts.push(make_user_mount(config, &mount.from, &mount.to, mount.options.as_deref())?);
    }

    let mut linux = LinuxBuilder::default()
        .namespaces(namespaces(config.user_namespace_enabled())?)
        .masked_paths(MASKED_PATHS.iter().map(|path| path.to_string()).collect::<Vec<_>>())
        .readonly_paths(READONLY_PATHS.iter().map(|path| path.to_string()).collect::<Vec<_>>())
        .resources(resources(config)?);

    if let Some(maps) = id_maps {
        linux = linux.uid_mappings(maps.uid.clone()).gid_mappings(maps.gid.clone());
    }

    Ok(SpecBuilder::default()
        .root(root)
        .hostname(CONTAINER_HOSTNAME)
        .mounts(mounts)
        .linux(linux.build()?)
        .build()?)
}

fn make_user_mount(
    config: &RunjConfig,
    from: &Path,
    to: &Path,
    options: Option<&[String]>,
) -> Result<Mount> {
    let from = utils::to_absolute(from)
        .map_err(|source| SpecError::ResolvePath { path: from.to_path_buf(), source })?;
    let to = Path::new("/").join(to.strip_prefix("/").unwrap_or(to));

    let (kind, mut mount_options) = if utils::file_exists(&from) {
        ("bind", vec!["bind".to_string(), "private".to_string()])
    } else if utils::directory_exists(&from) {
        ("rbind", vec!["rbind".to_string(), "private".to_string()])
    } else {
        return Err(SpecError::MountSourceMissing(from));
    };

    if let Some(options) = options {
        mount_options.extend(options.iter().cloned());
    }

    if config.chmod_exec && mount_options.iter().any(|option| option == "exec") {
        let mask = umask(Mode::empty());
        let result = fs::set_permissions(&from, fs::Permissions::from_mode(0o777));
        umask(mask);
        result.map_err(|source| SpecError::Chmod { path: from.clone(), source })?;
    }

    Ok(MountBuilder::default()
        .destination(to)
        .typ(kind)
        .source(from)
        .options(mount_options)
        .build()?)
}

fn default_mounts() -> Result<Vec<Mount>> {
    Ok(vec![
        MountBuilder::default()
            .destination("/proc")
            .typ("proc")
            .source("proc")
            .options(owned(&["noexec", "nosuid", "nodev"]))
            .build()?,
        MountBuilder::default()
            .destination("/dev")
            .typ("tmpfs")
            .source("tmpfs")
            .options(owned(&["nosuid", "strictatime", "mode=755", "size=65536k"]))
            .build()?,
        // A devpts mount usually carries gid=5, which breaks down in
        // rootless containers.
        MountBuilder::default()
            .destination("/dev/pts")
            .typ("devpts")
            .source("devpts")
            .options(owned(&["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"]))
            .build()?,
        MountBuilder::default()
            .destination("/dev/shm")
            .typ("tmpfs")
            .source("shm")
            .options(owned(&["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]))
            .build()?,
        MountBuilder::default()
            .destination("/dev/mqueue")
            .typ("mqueue")
            .source("mqueue")
            .options(owned(&["nosuid", "noexec", "nodev"]))
            .build()?,
        MountBuilder::default()
            .destination("/sys")
            .typ("sysfs")
            .source("sysfs")
            .options(owned(&["nosuid", "noexec", "nodev", "ro"]))
            .build()?,
    ])
}

fn namespaces(user_ns: bool) -> std::result::Result<Vec<LinuxNamespace>, OciSpecError> {
    let mut kinds = vec![
        LinuxNamespaceType::Pid,
        LinuxNamespaceType::Network,
        LinuxNamespaceType::Ipc,
        LinuxNamespaceType::Uts,
        LinuxNamespaceType::Mount,
        LinuxNamespaceType::Cgroup,
    ];
    if user_ns {
        kinds.push(LinuxNamespaceType::User);
    }

    kinds
        .into_iter()
        .map(|kind| LinuxNamespaceBuilder::default().typ(kind).build())
        .collect()
}

fn resources(config: &RunjConfig) -> std::result::Result<LinuxResources, OciSpecError> {
    let cgroup = &config.limits.cgroup;

    let mut cpu = LinuxCpuBuilder::default();
    if let Some(shares) = cgroup.cpu_shares {
        cpu = cpu.shares(shares);
    }
    if let Some(quota) = cgroup.cpu_quota {
        cpu = cpu.quota(quota);
    }
    if let Some(cpus) = &cgroup.cpuset_cpus {
        cpu = cpu.cpus(cpus.clone());
    }
    if let Some(mems) = &cgroup.cpuset_mems {
        cpu = cpu.mems(mems.clone());
    }

    // A container gets a hard memory cap and no swap unless told otherwise.
    let limit = cgroup.memory.unwrap_or(DEFAULT_MEMORY_LIMIT_BYTES);
    let swap = cgroup.memory_swap.unwrap_or(limit);
    let mut memory = LinuxMemoryBuilder::default()
        .limit(limit)
        .swap(swap)
        .swappiness(cgroup.swappiness.unwrap_or(DEFAULT_SWAPPINESS));
    if let Some(reservation) = cgroup.memory_reservation {
        memory = memory.reservation(reservation);
    }

    let pids =
        LinuxPidsBuilder::default().limit(cgroup.pids_limit.unwrap_or(DEFAULT_PIDS_LIMIT)).build()?;

    LinuxResourcesBuilder::default()
        .cpu(cpu.build()?)
        .memory(memory.build()?)
        .pids(pids)
        .build()
}

fn owned(options: &[&str]) -> Vec<String> {
    options.iter().map(|option| option.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(json: serde_json::Value) -> RunjConfig {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_spec_defaults() {
        let config = base_config(serde_json::json!({
            "rootfs": "/images/busybox/rootfs",
            "cwd": "/",
            "command": ["/bin/true"],
        }));

        let spec = make_container_spec(&config, None).unwrap();

        let root = spec.root().as_ref().unwrap();
        assert_eq!(root.path(), &PathBuf::from("/images/busybox/rootfs"));
        assert_eq!(root.readonly(), Some(true));
        assert_eq!(spec.hostname().as_deref(), Some(CONTAINER_HOSTNAME));

        let mounts = spec.mounts().as_ref().unwrap();
        assert_eq!(mounts.len(), 6);
        assert_eq!(mounts[0].destination(), &PathBuf::from("/proc"));
        assert_eq!(mounts[5].destination(), &PathBuf::from("/sys"));

        let linux = spec.linux().as_ref().unwrap();
        assert_eq!(linux.namespaces().as_ref().unwrap().len(), 6);
        assert_eq!(linux.masked_paths().as_ref().unwrap().len(), 10);
        assert_eq!(linux.readonly_paths().as_ref().unwrap().len(), 5);

        let resources = linux.resources().as_ref().unwrap();
        let memory = resources.memory().as_ref().unwrap();
        assert_eq!(memory.limit(), Some(512 * 1024 * 1024));
        assert_eq!(memory.swap(), Some(512 * 1024 * 1024));
        assert_eq!(memory.swappiness(), Some(0));
        assert_eq!(resources.pids().as_ref().unwrap().limit(), 64);
    }

    #[test]
    fn test_spec_overlay_root_is_writable() {
        let config = base_config(serde_json::json!({
            "overlayfs": {
                "lower_dir": "/l", "upper_dir": "/u", "work_dir": "/w", "merged_dir": "/m",
            },
            "cwd": "/",
            "command": ["/bin/true"],
        }));

        let spec = make_container_spec(&config, None).unwrap();
        let root = spec.root().as_ref().unwrap();
        assert_eq!(root.path(), &PathBuf::from("/m"));
        assert_eq!(root.readonly(), Some(false));
    }

    #[test]
    fn test_spec_memory_swap_follows_limit() {
        let config = base_config(serde_json::json!({
            "rootfs": "/rootfs",
            "cwd": "/",
            "command": ["/bin/true"],
            "limits": { "cgroup": { "memory": 16777216 } },
        }));

        let spec = make_container_spec(&config, None).unwrap();
        let linux = spec.linux().as_ref().unwrap();
        let memory = linux.resources().as_ref().unwrap().memory().as_ref().unwrap();
        assert_eq!(memory.limit(), Some(16777216));
        assert_eq!(memory.swap(), Some(16777216));
    }

    #[test]
    fn test_spec_user_namespace_adds_mappings() {
        let config = base_config(serde_json::json!({
            "rootfs": "/rootfs",
            "cwd": "/",
            "command": ["/bin/true"],
            "user_namespace": {
                "enabled": true,
                "root_uid": 1000, "uid_map_begin": 100000, "uid_map_count": 65536,
                "root_gid": 1000, "gid_map_begin": 100000, "gid_map_count": 65536,
            },
        }));

        let maps = crate::user_ns::resolve(config.user_namespace.as_ref().unwrap()).unwrap();
        let spec = make_container_spec(&config, Some(&maps)).unwrap();

        let linux = spec.linux().as_ref().unwrap();
        assert_eq!(linux.namespaces().as_ref().unwrap().len(), 7);
        let uid_mappings = linux.uid_mappings().as_ref().unwrap();
        assert_eq!(uid_mappings.len(), 2);
        assert_eq!(uid_mappings[0].container_id(), 0);
        assert_eq!(uid_mappings[0].size(), 1);
    }

    #[test]
    fn test_user_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let file_source = dir.path().join("input.txt");
        fs::write(&file_source, b"data").unwrap();

        let config = base_config(serde_json::json!({
            "rootfs": "/rootfs",
            "cwd": "/",
            "command": ["/bin/true"],
            "mounts": [
                { "from": file_source, "to": "seele/input.txt" },
                { "from": dir.path(), "to": "/data", "options": ["rw"] },
            ],
        }));

        let spec = make_container_spec(&config, None).unwrap();
        let mounts = spec.mounts().as_ref().unwrap();

        let file_mount = &mounts[6];
        assert_eq!(file_mount.destination(), &PathBuf::from("/seele/input.txt"));
        assert_eq!(file_mount.typ().as_deref(), Some("bind"));
        assert_eq!(
            file_mount.options().as_ref().unwrap(),
            &vec!["bind".to_string(), "private".to_string()]
        );

        let dir_mount = &mounts[7];
        assert_eq!(dir_mount.typ().as_deref(), Some("rbind"));
        assert_eq!(
            dir_mount.options().as_ref().unwrap(),
            &vec!["rbind".to_string(), "private".to_string(), "rw".to_string()]
        );
    }

    #[test]
    fn test_missing_mount_source() {
        let config = base_config(serde_json::json!({
            "rootfs": "/rootfs",
            "cwd": "/",
            "command": ["/bin/true"],
            "mounts": [ { "from": "/definitely/not/here", "to": "/data" } ],
        }));

        assert!(matches!(
            make_container_spec(&config, None),
            Err(SpecError::MountSourceMissing(path)) if path == PathBuf::from("/definitely/not/here")
        ));
    }
}
