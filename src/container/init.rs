use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::os::fd::RawFd;

use nix::sched::{clone, unshare, CloneFlags};
use nix::sys::resource::setrlimit;
use nix::sys::signal::Signal;
use nix::unistd::{chdir, setgroups, setresgid, setresuid, setsid, Gid, Pid, Uid};
use oci_spec::runtime::{LinuxNamespaceType, Spec};

use super::channel::{ChannelError, Receiver, Sender};
use super::rootfs::{self, RootfsError};
use super::{
    AckMessage, ContainerProcess, InitPayload, SyncMessage, ACK_PIPE_ENV, INIT_PIPE_ENV,
    SYNC_PIPE_ENV,
};
use crate::overlayfs::{self, OverlayError};

const INIT_STACK_SIZE: usize = 1024 * 1024;

/// Namespace entry order. The user namespace always goes first so the
/// remaining unshares run with a full capability set inside it.
const ORDERED_NAMESPACES: &[CloneFlags] = &[
    CloneFlags::CLONE_NEWUSER,
    CloneFlags::CLONE_NEWPID,
    CloneFlags::CLONE_NEWUTS,
    CloneFlags::CLONE_NEWIPC,
    CloneFlags::CLONE_NEWNET,
    CloneFlags::CLONE_NEWCGROUP,
    CloneFlags::CLONE_NEWNS,
];

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("missing or invalid environment variable {0}")]
    BadEnv(&'static str),
    #[error("{operation} failed")]
    Syscall {
        operation: &'static str,
        #[source]
        source: nix::Error,
    },
    #[error("prctl failed with code {0}")]
    Prctl(i32),
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error(transparent)]
    Rootfs(#[from] RootfsError),
    #[error("the command contains an interior NUL byte")]
    BadCommand,
    #[error("unsupported namespace configuration: {0}")]
    UnsupportedNamespace(String),
    #[error("failed to exec {program}")]
    Exec {
        program: String,
        #[source]
        source: nix::Error,
    },
}

type Result<T> = std::result::Result<T, InitError>;

/// Entry point of the re-exec'd trampoline (`argv[1] == "init"`).
///
/// Everything below runs on the single thread this process was exec'd with,
/// which is what keeps the namespace transitions attached to the right
/// thread. The inherited fds 0/1/2 already point at the container's stdio
/// files, so failures are reported over the sync channel, never printed.
pub fn run() -> ! {
    match initialize() {
        Ok(()) => std::process::exit(0),
        Err(_) => std::process::exit(1),
    }
}

fn initialize() -> Result<()> {
    let mut payload_rx: Receiver<InitPayload> = Receiver::from_raw_fd(fd_from_env(INIT_PIPE_ENV)?);
    let mut sync_tx: Sender<SyncMessage> = Sender::from_raw_fd(fd_from_env(SYNC_PIPE_ENV)?);
    let mut ack_rx: Receiver<AckMessage> = Receiver::from_raw_fd(fd_from_env(ACK_PIPE_ENV)?);

    // Blocks until the supervisor has finished the cgroup placement.
    let payload = payload_rx.recv()?;

    match intermediate(&payload, &mut sync_tx, &mut ack_rx) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = sync_tx.send(&SyncMessage::Error { message: error_chain(&err) });
            Err(err)
        }
    }
}

/// The intermediate stage: enters the namespaces, mounts the overlay and
/// forks the container init as a child of the supervisor.
fn intermediate(
    payload: &InitPayload,
    sync_tx: &mut Sender<SyncMessage>,
    ack_rx: &mut Receiver<AckMessage>,
) -> Result<()> {
    prctl::set_name("runj:[1:INTER]").map_err(InitError::Prctl)?;

    let namespaces = requested_namespaces(&payload.spec)?;

    if namespaces.contains(CloneFlags::CLONE_NEWUSER) {
        unshare(CloneFlags::CLONE_NEWUSER)
            .map_err(|source| InitError::Syscall { operation: "unshare(user)", source })?;

        // The supervisor writes the uid/gid maps, that cannot be done from
        // inside the new namespace.
        sync_tx.send(&SyncMessage::WriteMapping)?;
        let AckMessage::MappingWritten = ack_rx.recv()?;
        become_root()?;
    }

    for flag in ORDERED_NAMESPACES {
        if *flag == CloneFlags::CLONE_NEWUSER || !namespaces.contains(*flag) {
            continue;
        }

        unshare(*flag).map_err(|source| InitError::Syscall { operation: "unshare", source })?;
    }

    // Nothing mounted from here on may leak back to the host.
    rootfs::make_propagation_private()?;
    overlayfs::mount_from_env()?;

    let init_pid = clone_init(payload, sync_tx)?;
    sync_tx.send(&SyncMessage::InitPid { pid: init_pid.as_raw() })?;

    Ok(())
}

/// Forks the container init. CLONE_PARENT makes it a child of the
/// supervisor so the wait and the outcome classification happen there; it
/// still lands in the namespaces unshared above, becoming pid 1 of the new
/// pid namespace.
fn clone_init(payload: &InitPayload, sync_tx: &mut Sender<SyncMessage>) -> Result<Pid> {
    let mut stack = vec![0u8; INIT_STACK_SIZE];

    let pid = unsafe {
        clone(
            Box::new(|| init_process_outcome(payload, sync_tx)),
            &mut stack,
            CloneFlags::CLONE_PARENT,
            Some(Signal::SIGCHLD as i32),
        )
    }
    .map_err(|source| InitError::Syscall { operation: "clone", source })?;

    Ok(pid)
}

fn init_process_outcome(payload: &InitPayload, sync_tx: &mut Sender<SyncMessage>) -> isize {
    match init_process(payload, sync_tx) {
        Ok(never) => match never {},
        Err(err) => {
            let _ = sync_tx.send(&SyncMessage::Error { message: error_chain(&err) });
            127
        }
    }
}

/// The final stage, running as pid 1 of the container: switch the root,
/// drop the identity, apply the per-process limits and exec the command.
fn init_process(payload: &InitPayload, sync_tx: &mut Sender<SyncMessage>) -> Result<Infallible> {
    prctl::set_name("runj:[2:INIT]").map_err(InitError::Prctl)?;
    setsid().map_err(|source| InitError::Syscall { operation: "setsid", source })?;

    if let Some(hostname) = payload.spec.hostname().as_ref() {
        nix::unistd::sethostname(hostname)
            .map_err(|source| InitError::Syscall { operation: "sethostname", source })?;
    }

    rootfs::prepare(&payload.spec)?;

    let process = &payload.process;

    // The working directory is commonly provided by a mount that was just
    // assembled, create it on demand.
    let _ = std::fs::create_dir_all(&process.cwd);
    chdir(&process.cwd).map_err(|source| InitError::Syscall { operation: "chdir", source })?;

    for rule in &process.rlimits {
        setrlimit(rule.kind.resource(), rule.soft, rule.hard)
            .map_err(|source| InitError::Syscall { operation: "setrlimit", source })?;
    }

    drop_identity(process)?;

    if process.no_new_privileges {
        prctl::set_no_new_privileges(true).map_err(InitError::Prctl)?;
    }

    // A successful exec closes our end of the channel, which is the
    // supervisor's start confirmation.
    sync_tx.set_cloexec()?;

    let argv: Vec<CString> = process
        .args
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| InitError::BadCommand)?;
    let envp: Vec<CString> = process
        .env
        .iter()
        .map(|entry| CString::new(entry.as_str()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| InitError::BadCommand)?;

    nix::unistd::execvpe(&argv[0], &argv, &envp)
        .map_err(|source| InitError::Exec { program: process.args[0].clone(), source })?;

    unreachable!("execvpe returned without an error")
}

fn become_root() -> Result<()> {
    let root_uid = Uid::from_raw(0);
    let root_gid = Gid::from_raw(0);

    setresgid(root_gid, root_gid, root_gid)
        .map_err(|source| InitError::Syscall { operation: "setresgid", source })?;
    setgroups(&[root_gid])
        .map_err(|source| InitError::Syscall { operation: "setgroups", source })?;
    setresuid(root_uid, root_uid, root_uid)
        .map_err(|source| InitError::Syscall { operation: "setresuid", source })?;

    Ok(())
}

fn drop_identity(process: &ContainerProcess) -> Result<()> {
    let uid = Uid::from_raw(process.uid);
    let gid = Gid::from_raw(process.gid);

    setresgid(gid, gid, gid)
        .map_err(|source| InitError::Syscall { operation: "setresgid", source })?;
    setgroups(&[gid]).map_err(|source| InitError::Syscall { operation: "setgroups", source })?;
    setresuid(uid, uid, uid)
        .map_err(|source| InitError::Syscall { operation: "setresuid", source })?;

    Ok(())
}

fn requested_namespaces(spec: &Spec) -> Result<CloneFlags> {
    let mut flags = CloneFlags::empty();

    let namespaces = spec
        .linux()
        .as_ref()
        .and_then(|linux| linux.namespaces().as_ref())
        .cloned()
        .unwrap_or_default();

    for namespace in &namespaces {
        if namespace.path().is_some() {
            return Err(InitError::UnsupportedNamespace(
                "joining an existing namespace by path".to_string(),
            ));
        }

        flags |= match namespace.typ() {
            LinuxNamespaceType::User => CloneFlags::CLONE_NEWUSER,
            LinuxNamespaceType::Pid => CloneFlags::CLONE_NEWPID,
            LinuxNamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
            LinuxNamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
            LinuxNamespaceType::Network => CloneFlags::CLONE_NEWNET,
            LinuxNamespaceType::Cgroup => CloneFlags::CLONE_NEWCGROUP,
            LinuxNamespaceType::Mount => CloneFlags::CLONE_NEWNS,
            other => {
                return Err(InitError::UnsupportedNamespace(format!("{other:?}")));
            }
        };
    }

    Ok(flags)
}

fn fd_from_env(name: &'static str) -> Result<RawFd> {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .ok_or(InitError::BadEnv(name))
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}

#[cfg(test)]
mod tests {
    use oci_spec::runtime::{LinuxBuilder, LinuxNamespaceBuilder, SpecBuilder};

    use super::*;

    #[test]
    fn test_requested_namespaces() {
        let namespaces = vec![
            LinuxNamespaceBuilder::default().typ(LinuxNamespaceType::Pid).build().unwrap(),
            LinuxNamespaceBuilder::default().typ(LinuxNamespaceType::Mount).build().unwrap(),
        ];
        let spec = SpecBuilder::default()
            .linux(LinuxBuilder::default().namespaces(namespaces).build().unwrap())
            .build()
            .unwrap();

        let flags = requested_namespaces(&spec).unwrap();
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let err = InitError::Syscall {
            operation: "unshare",
            source: nix::Error::EPERM,
        };
        let message = error_chain(&err);
        assert!(message.starts_with("unshare failed: "));
    }
}
