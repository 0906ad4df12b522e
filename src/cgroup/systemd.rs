use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use dbus::arg::{RefArg, Variant};
use dbus::blocking::stdintf::org_freedesktop_dbus::Properties;
use dbus::blocking::SyncConnection;
use dbus::message::MatchRule;
use nix::unistd::getpid;
use tracing::{debug, warn};

use super::dbus::DbusConnManager;
use super::{
    add_process, write_cgroup_file, CgroupError, MANDATORY_CONTROLLERS, UNIFIED_MOUNTPOINT,
};
use crate::utils::RUNJ_INSTANCE_ID;

const SYSTEMD_DESTINATION: &str = "org.freedesktop.systemd1";
const SYSTEMD_OBJECT_PATH: &str = "/org/freedesktop/systemd1";
const MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";
const UNIT_EXISTS_ERROR: &str = "org.freedesktop.systemd1.UnitExists";

const PARENT_SLICE: &str = "user.slice";
const METHOD_CALL_TIMEOUT: Duration = Duration::from_secs(5);
const JOB_TIMEOUT: Duration = Duration::from_secs(30);

type Result<T> = std::result::Result<T, CgroupError>;

/// Provisions the container cgroup through a delegated transient scope.
/// Returns the scope cgroup, the container cgroup below it and the unit
/// name, in creation order.
///
/// The scope adopts the current process, which immediately moves on into a
/// `main.scope` leaf: controllers can only be enabled for children of a
/// cgroup that hosts no processes itself.
pub fn create_cgroup() -> Result<(PathBuf, PathBuf, String)> {
    let manager = DbusConnManager::new();

    let unit = format!("runj-{}.scope", &*RUNJ_INSTANCE_ID);
    start_scope(&manager, &unit)?;

    let scope_path = scope_cgroup_path(&manager, &unit)?;

    let main_scope = scope_path.join("main.scope");
    make_cgroup_dir(&main_scope)?;
    add_process(&main_scope, getpid())?;

    enable_mandatory_controllers(&scope_path)?;

    let container_scope = scope_path.join("container.scope");
    make_cgroup_dir(&container_scope)?;

    Ok((scope_path, container_scope, unit))
}

/// Clears a possible failed state of the unit so a later invocation can
/// reuse the name.
pub fn reset_failed(unit: &str) -> Result<()> {
    let manager = DbusConnManager::new();
    manager.retry_on_disconnect(|connection| {
        connection
            .with_proxy(SYSTEMD_DESTINATION, SYSTEMD_OBJECT_PATH, METHOD_CALL_TIMEOUT)
            .method_call(MANAGER_INTERFACE, "ResetFailedUnit", (unit,))
            .map(|_: ()| ())
    })
}

fn start_scope(manager: &DbusConnManager, unit: &str) -> Result<()> {
    debug!("starting transient unit {unit}");

    match manager.retry_on_disconnect(|connection| start_unit_once(connection, unit)) {
        Ok(Some(result)) if result == "done" => Ok(()),
        Ok(Some(result)) => {
            reset_failed_quietly(unit);
            Err(CgroupError::UnitFailed { unit: unit.to_string(), result })
        }
        Ok(None) => {
            reset_failed_quietly(unit);
            Err(CgroupError::UnitTimeout { unit: unit.to_string() })
        }
        // A leftover unit with this name is fine, the start is idempotent.
        Err(CgroupError::Bus(err)) if err.name() == Some(UNIT_EXISTS_ERROR) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Issues StartTransientUnit and waits for the JobRemoved signal of the
/// returned job. `None` means the job did not complete within the budget.
fn start_unit_once(
    connection: &SyncConnection,
    unit: &str,
) -> std::result::Result<Option<String>, dbus::Error> {
    let (tx, rx) = mpsc::channel::<(String, String)>();

    let rule = MatchRule::new_signal(MANAGER_INTERFACE, "JobRemoved");
    let token = connection.add_match(rule, move |_: (), _, message| {
        if let Ok((_id, job, _unit, result)) =
            message.read4::<u32, dbus::Path<'static>, String, String>()
        {
            let _ = tx.send((job.to_string(), result));
        }
        true
    })?;

    let proxy =
        connection.with_proxy(SYSTEMD_DESTINATION, SYSTEMD_OBJECT_PATH, METHOD_CALL_TIMEOUT);
    let aux: Vec<(&str, Vec<(&str, Variant<Box<dyn RefArg>>)>)> = Vec::new();
    let reply: std::result::Result<(dbus::Path<'static>,), dbus::Error> = proxy.method_call(
        MANAGER_INTERFACE,
        "StartTransientUnit",
        (unit, "replace", scope_properties(), aux),
    );

    let job_path = match reply {
        Ok((job_path,)) => job_path.to_string(),
        Err(err) => {
            let _ = connection.remove_match(token);
            return Err(err);
        }
    };

    let deadline = Instant::now() + JOB_TIMEOUT;
    let mut outcome = None;
    'wait: while Instant::now() < deadline {
        if let Err(err) = connection.process(Duration::from_millis(200)) {
            let _ = connection.remove_match(token);
            return Err(err);
        }

        while let Ok((job, result)) = rx.try_recv() {
            if job == job_path {
                outcome = Some(result);
                break 'wait;
            }
        }
    }

    let _ = connection.remove_match(token);
    Ok(outcome)
}

fn scope_properties() -> Vec<(&'static str, Variant<Box<dyn RefArg>>)> {
    vec![
        (
            "Description",
            Variant(Box::new("runj, a single-shot container runtime for online judges".to_string())),
        ),
        ("Delegate", Variant(Box::new(true))),
        ("Slice", Variant(Box::new(PARENT_SLICE.to_string()))),
        ("DefaultDependencies", Variant(Box::new(false))),
        ("PIDs", Variant(Box::new(vec![process::id()]))),
    ]
}

fn scope_cgroup_path(manager: &DbusConnManager, unit: &str) -> Result<PathBuf> {
    let control_group: String = manager.retry_on_disconnect(|connection| {
        connection
            .with_proxy(SYSTEMD_DESTINATION, SYSTEMD_OBJECT_PATH, METHOD_CALL_TIMEOUT)
            .get(MANAGER_INTERFACE, "ControlGroup")
    })?;

    Ok(scope_path_under(Path::new(UNIFIED_MOUNTPOINT), &control_group, unit))
}

fn scope_path_under(root: &Path, control_group: &str, unit: &str) -> PathBuf {
    root.join(control_group.trim_start_matches('/')).join(PARENT_SLICE).join(unit)
}

fn enable_mandatory_controllers(scope_path: &Path) -> Result<()> {
    let subtree_control = scope_path.join("cgroup.subtree_control");
    for controller in MANDATORY_CONTROLLERS {
        write_cgroup_file(&subtree_control, format!("+{controller}"))?;
    }

    Ok(())
}

fn make_cgroup_dir(path: &Path) -> Result<()> {
    DirBuilder::new().mode(0o775).create(path).map_err(|source| CgroupError::WrappedIo {
        operation: "create",
        path: path.to_path_buf(),
        source,
    })
}

fn reset_failed_quietly(unit: &str) {
    if let Err(err) = reset_failed(unit) {
        warn!("failed to reset the failed unit {unit}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_path_under() {
        let path = scope_path_under(
            Path::new("/sys/fs/cgroup"),
            "/user.slice/user-1000.slice/user@1000.service",
            "runj-abcDEF123456.scope",
        );
        assert_eq!(
            path,
            PathBuf::from(
                "/sys/fs/cgroup/user.slice/user-1000.slice/user@1000.service/user.slice/runj-abcDEF123456.scope"
            )
        );
    }

    #[test]
    fn test_scope_properties_shape() {
        let properties = scope_properties();
        let names: Vec<_> = properties.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, ["Description", "Delegate", "Slice", "DefaultDependencies", "PIDs"]);
    }
}
