use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::config::RunjConfig;

pub mod cgroupfs;
pub mod dbus;
pub mod resources;
pub mod stats;
pub mod systemd;

/// The cgroup v2 unified hierarchy mountpoint.
pub const UNIFIED_MOUNTPOINT: &str = "/sys/fs/cgroup";

pub const MANDATORY_CONTROLLERS: &[&str] = &["cpu", "cpuset", "memory"];

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("missing cgroup controllers, available: {available}")]
    ControllersMissing { available: String },
    #[error("failed to {operation} {path}")]
    WrappedIo {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot reach the systemd user bus (hint: for rootless mode, install the dbus-user-session package and run `systemctl --user start dbus`)")]
    BusUnavailable(#[source] ::dbus::Error),
    #[error("error talking to systemd over dbus")]
    Bus(#[source] ::dbus::Error),
    #[error("could not detect DBUS_SESSION_BUS_ADDRESS; make sure the dbus-user-session or dbus-daemon package is installed")]
    BusAddressNotFound,
    #[error("could not detect the OwnerUID of the user bus")]
    OwnerUidNotFound,
    #[error("systemd unit {unit} entered state `{result}` instead of `done`")]
    UnitFailed { unit: String, result: String },
    #[error("timeout waiting for systemd to create {unit}")]
    UnitTimeout { unit: String },
    #[error("malformed line in {path}: {line}")]
    Parse { path: PathBuf, line: String },
}

type Result<T> = std::result::Result<T, CgroupError>;

/// The cgroup directories backing one container, in creation order. The
/// container cgroup always exists; the parent only when the systemd backend
/// provisioned a delegated scope around it.
#[derive(Debug)]
pub struct ProvisionedCgroup {
    pub parent: Option<PathBuf>,
    pub container: PathBuf,
    pub scope_unit: Option<String>,
}

/// Creates the cgroup directory for the container, choosing a backend:
/// an explicit `cgroup_path` always selects cgroupfs below it, user
/// namespace mode selects the systemd backend, everything else lands in
/// cgroupfs under the unified mountpoint.
pub fn provision(config: &RunjConfig) -> Result<ProvisionedCgroup> {
    check_mandatory_controllers()?;

    if let Some(parent) = &config.cgroup_path {
        let container = cgroupfs::create_cgroup(parent)?;
        return Ok(ProvisionedCgroup { parent: None, container, scope_unit: None });
    }

    if config.user_namespace_enabled() {
        let (parent, container, unit) = systemd::create_cgroup()?;
        return Ok(ProvisionedCgroup {
            parent: Some(parent),
            container,
            scope_unit: Some(unit),
        });
    }

    let container = cgroupfs::create_cgroup(Path::new(UNIFIED_MOUNTPOINT))?;
    Ok(ProvisionedCgroup { parent: None, container, scope_unit: None })
}

impl ProvisionedCgroup {
    /// Removes the created directories in reverse creation order and resets
    /// the transient unit if one backed them. Failures are logged, never
    /// propagated; running it twice is harmless.
    pub fn teardown(&self) {
        remove_cgroup_dir(&self.container);

        if let Some(parent) = &self.parent {
            remove_cgroup_dir(parent);
        }

        if let Some(unit) = &self.scope_unit {
            if let Err(err) = systemd::reset_failed(unit) {
                warn!("failed to reset the transient unit {unit}: {err}");
            }
        }
    }
}

fn remove_cgroup_dir(path: &Path) {
    match fs::remove_dir(path) {
        Ok(()) => debug!("removed cgroup directory {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove cgroup directory {}: {err}", path.display()),
    }
}

/// Verifies that the host exposes the controllers the runtime depends on.
pub fn check_mandatory_controllers() -> Result<()> {
    let available = read_cgroup_file(Path::new(UNIFIED_MOUNTPOINT).join("cgroup.controllers"))?;
    ensure_mandatory_controllers(&available)
}

fn ensure_mandatory_controllers(available: &str) -> Result<()> {
    let controllers: Vec<_> = available.split_whitespace().collect();
    if MANDATORY_CONTROLLERS.iter().any(|wanted| !controllers.contains(wanted)) {
        return Err(CgroupError::ControllersMissing { available: available.trim().to_string() });
    }

    Ok(())
}

pub fn read_cgroup_file(path: impl AsRef<Path>) -> Result<String> {
    fs::read_to_string(path.as_ref()).map_err(|source| CgroupError::WrappedIo {
        operation: "read",
        path: path.as_ref().to_path_buf(),
        source,
    })
}

pub fn write_cgroup_file(path: impl AsRef<Path>, content: impl AsRef<str>) -> Result<()> {
    fs::write(path.as_ref(), content.as_ref()).map_err(|source| CgroupError::WrappedIo {
        operation: "write",
        path: path.as_ref().to_path_buf(),
        source,
    })
}

/// Moves a process into the cgroup.
pub fn add_process(cgroup: &Path, pid: Pid) -> Result<()> {
    write_cgroup_file(cgroup.join("cgroup.procs"), pid.to_string())
}

/// Delivers SIGKILL to every process in the cgroup. Prefers the atomic
/// `cgroup.kill` knob and falls back to signalling the members of
/// `cgroup.procs` one by one on kernels without it.
pub fn kill_all(cgroup: &Path) -> Result<()> {
    match write_cgroup_file(cgroup.join("cgroup.kill"), "1") {
        Ok(()) => return Ok(()),
        Err(err) => debug!("cgroup.kill unavailable, falling back to cgroup.procs: {err}"),
    }

    let procs = read_cgroup_file(cgroup.join("cgroup.procs"))?;
    for line in procs.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let pid = line.parse::<i32>().map_err(|_| CgroupError::Parse {
            path: cgroup.join("cgroup.procs"),
            line: line.to_string(),
        })?;

        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(err) => warn!("failed to kill pid {pid}: {err}"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_mandatory_controllers() {
        ensure_mandatory_controllers("cpuset cpu io memory hugetlb pids rdma misc\n").unwrap();

        let err = ensure_mandatory_controllers("cpu io pids\n").unwrap_err();
        assert!(matches!(
            err,
            CgroupError::ControllersMissing { available } if available == "cpu io pids"
        ));
    }

    #[test]
    fn test_cgroup_file_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cgroup.subtree_control");

        write_cgroup_file(&path, "+cpu").unwrap();
        assert_eq!(read_cgroup_file(&path).unwrap(), "+cpu");

        let err = read_cgroup_file(dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, CgroupError::WrappedIo { operation: "read", .. }));
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("runj-container-test");
        fs::create_dir(&container).unwrap();

        let cgroup =
            ProvisionedCgroup { parent: None, container: container.clone(), scope_unit: None };
        cgroup.teardown();
        assert!(!container.exists());

        // The second pass observes the missing directory and stays quiet.
        cgroup.teardown();
    }
}
