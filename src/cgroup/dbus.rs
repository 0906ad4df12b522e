use std::env;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, RwLock};

use dbus::blocking::SyncConnection;
use dbus::channel::Channel;
use nix::unistd::getuid;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use super::CgroupError;
use crate::user_ns;

/// The process-wide bus connection. Lazily initialized; readers share it,
/// the reconnect path is serialized through the write lock.
static CONNECTION: Lazy<RwLock<Option<Arc<SyncConnection>>>> = Lazy::new(|| RwLock::new(None));

const DISCONNECTED_ERROR: &str = "org.freedesktop.DBus.Error.Disconnected";

type Result<T> = std::result::Result<T, CgroupError>;

#[derive(Debug, Default)]
pub struct DbusConnManager;

impl DbusConnManager {
    pub fn new() -> Self {
        Self
    }

    /// Runs `op` against the shared connection. A call that fails because
    /// the bus went away drops the cached connection and is retried once on
    /// a fresh one; the retry never recurses further.
    pub fn retry_on_disconnect<T>(
        &self,
        op: impl Fn(&SyncConnection) -> std::result::Result<T, dbus::Error>,
    ) -> Result<T> {
        let mut reconnected = false;
        loop {
            let connection = self.get_connection()?;
            match op(&connection) {
                Err(err) if !reconnected && is_disconnect_error(&err) => {
                    warn!("the dbus connection is gone, reconnecting: {err}");
                    self.reset_connection(&connection);
                    reconnected = true;
                }
                Err(err) => return Err(CgroupError::Bus(err)),
                Ok(value) => return Ok(value),
            }
        }
    }

    fn get_connection(&self) -> Result<Arc<SyncConnection>> {
        if let Some(connection) = CONNECTION.read().expect("dbus lock poisoned").as_ref() {
            return Ok(connection.clone());
        }

        let mut slot = CONNECTION.write().expect("dbus lock poisoned");
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        let connection = new_connection()?;
        *slot = Some(connection.clone());
        Ok(connection)
    }

    /// Clears the cached connection, but only if `connection` is still the
    /// cached one. A racing caller that already replaced it is left alone.
    fn reset_connection(&self, connection: &Arc<SyncConnection>) {
        let mut slot = CONNECTION.write().expect("dbus lock poisoned");
        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(current, connection) {
                *slot = None;
            }
        }
    }
}

fn is_disconnect_error(err: &dbus::Error) -> bool {
    err.name() == Some(DISCONNECTED_ERROR)
        || err.message().map(|message| message.contains("connection is closed")).unwrap_or(false)
}

fn new_connection() -> Result<Arc<SyncConnection>> {
    match new_user_connection() {
        Ok(connection) => Ok(Arc::new(connection)),
        Err(err) => {
            warn!("cannot reach the user bus ({err}), trying the system bus");
            SyncConnection::new_system().map(Arc::new).map_err(CgroupError::BusUnavailable)
        }
    }
}

/// Connects to the systemd user instance. The transport negotiates
/// EXTERNAL authentication during registration; the owner uid is probed
/// for diagnostics so a mismatch shows up in the logs instead of as an
/// opaque rejection.
fn new_user_connection() -> Result<SyncConnection> {
    let address = detect_session_bus_address()?;
    match detect_owner_uid() {
        Ok(uid) => debug!("connecting to the user bus at {address} (owner uid {uid})"),
        Err(err) => debug!("connecting to the user bus at {address} ({err})"),
    }

    let mut channel = Channel::open_private(&address).map_err(CgroupError::BusUnavailable)?;
    channel.register().map_err(CgroupError::BusUnavailable)?;
    Ok(SyncConnection::from(channel))
}

/// Returns `$DBUS_SESSION_BUS_ADDRESS` if set, otherwise
/// `unix:path=$XDG_RUNTIME_DIR/bus` if that socket exists, otherwise the
/// value reported by `systemctl --user show-environment`.
fn detect_session_bus_address() -> Result<String> {
    if let Ok(address) = env::var("DBUS_SESSION_BUS_ADDRESS") {
        if !address.is_empty() {
            return Ok(address);
        }
    }

    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        let bus_path = Path::new(&runtime_dir).join("bus");
        if bus_path.exists() {
            return Ok(format!("unix:path={}", bus_path.display()));
        }
    }

    let output = Command::new("systemctl")
        .args(["--user", "--no-pager", "show-environment"])
        .output()
        .map_err(|_| CgroupError::BusAddressNotFound)?;
    if !output.status.success() {
        return Err(CgroupError::BusAddressNotFound);
    }

    parse_show_environment(&String::from_utf8_lossy(&output.stdout))
        .ok_or(CgroupError::BusAddressNotFound)
}

fn parse_show_environment(output: &str) -> Option<String> {
    output
        .lines()
        .map(|line| line.trim())
        .find_map(|line| line.strip_prefix("DBUS_SESSION_BUS_ADDRESS="))
        .map(|address| address.to_string())
}

/// The uid owning the user bus: `getuid()` outside a user namespace,
/// otherwise the `OwnerUID=` row of `busctl --user status`, which matches
/// what the bus daemon expects from EXTERNAL authentication.
fn detect_owner_uid() -> Result<u32> {
    if !user_ns::running_in_user_ns() {
        return Ok(getuid().as_raw());
    }

    let output = Command::new("busctl")
        .args(["--user", "--no-pager", "status"])
        .output()
        .map_err(|_| CgroupError::OwnerUidNotFound)?;
    if !output.status.success() {
        return Err(CgroupError::OwnerUidNotFound);
    }

    parse_owner_uid(&String::from_utf8_lossy(&output.stdout)).ok_or(CgroupError::OwnerUidNotFound)
}

fn parse_owner_uid(output: &str) -> Option<u32> {
    output
        .lines()
        .map(|line| line.trim())
        .find_map(|line| line.strip_prefix("OwnerUID="))
        .and_then(|uid| uid.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_show_environment() {
        let output = "HOME=/home/runj\nDBUS_SESSION_BUS_ADDRESS=unix:path=/run/user/1000/bus\nLANG=C\n";
        assert_eq!(
            parse_show_environment(output).as_deref(),
            Some("unix:path=/run/user/1000/bus")
        );

        assert_eq!(parse_show_environment("HOME=/home/runj\n"), None);
    }

    #[test]
    fn test_parse_owner_uid() {
        let output = "BusName=org.freedesktop.DBus\n  OwnerUID=1000\nPID=812\n";
        assert_eq!(parse_owner_uid(output), Some(1000));

        assert_eq!(parse_owner_uid("PID=812\n"), None);
        assert_eq!(parse_owner_uid("OwnerUID=oops\n"), None);
    }

    #[test]
    fn test_is_disconnect_error() {
        let err = dbus::Error::new_custom("org.freedesktop.DBus.Error.Disconnected", "gone");
        assert!(is_disconnect_error(&err));

        let err = dbus::Error::new_custom("org.freedesktop.DBus.Error.Failed", "nope");
        assert!(!is_disconnect_error(&err));
    }
}
