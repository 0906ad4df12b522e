use std::ffi::CString;
use std::path::PathBuf;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use oci_spec::runtime::Spec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use self::channel::{channel, ChannelError, Receiver, Sender};
use crate::cgroup::{self, CgroupError};
use crate::config::RlimitRule;
use crate::user_ns::{self, ResolvedIdMaps};
use crate::utils::RUNJ_INSTANCE_ID;

pub mod channel;
pub mod init;
pub mod rootfs;

/// First argument that re-enters the binary as the in-namespace trampoline.
pub const INIT_ARG: &str = "init";

pub const INIT_PIPE_ENV: &str = "RUNJ_INIT_PIPE";
pub const SYNC_PIPE_ENV: &str = "RUNJ_SYNC_PIPE";
pub const ACK_PIPE_ENV: &str = "RUNJ_ACK_PIPE";

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Cgroup(#[from] CgroupError),
    #[error("failed to fork the intermediate process")]
    Fork(#[source] nix::Error),
    #[error("the container process failed to start: {0}")]
    Start(String),
    #[error("failed to write the id mappings for pid {pid}")]
    IdMap {
        pid: Pid,
        #[source]
        source: std::io::Error,
    },
    #[error("received unexpected message {received} while waiting for {expected}")]
    UnexpectedMessage { expected: &'static str, received: String },
    #[error("the container has no running process")]
    NotRunning,
    #[error("failed to wait for the container process")]
    Wait(#[source] nix::Error),
}

type Result<T> = std::result::Result<T, ContainerError>;

/// Everything the trampoline needs on the other side of the exec boundary.
#[derive(Debug, Serialize, Deserialize)]
pub struct InitPayload {
    pub spec: Spec,
    pub process: ContainerProcess,
}

/// The single process run inside the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerProcess {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub rlimits: Vec<RlimitRule>,
    pub no_new_privileges: bool,
}

/// Messages the trampoline sends back to the supervisor.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// The intermediate process entered its user namespace and needs the
    /// supervisor to write the id mappings.
    WriteMapping,
    /// The container init process has been created.
    InitPid { pid: i32 },
    /// Setup failed before the exec.
    Error { message: String },
}

impl SyncMessage {
    fn name(&self) -> String {
        match self {
            Self::WriteMapping => "write_mapping".to_string(),
            Self::InitPid { .. } => "init_pid".to_string(),
            Self::Error { message } => format!("error: {message}"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AckMessage {
    MappingWritten,
}

/// Handle for the single container of this invocation. Namespace entry,
/// the rootfs switch and the final exec happen in the re-exec'd trampoline;
/// the handle drives it and owns signalling and teardown on the host side.
pub struct Container {
    id: String,
    spec: Option<Spec>,
    process: Option<ContainerProcess>,
    id_maps: Option<ResolvedIdMaps>,
    cgroup_path: PathBuf,
    init_pid: Option<Pid>,
}

impl Container {
    pub fn create(
        spec: Spec,
        process: ContainerProcess,
        id_maps: Option<ResolvedIdMaps>,
        cgroup_path: PathBuf,
    ) -> Self {
        Self {
            id: format!("runj-container-{}", &*RUNJ_INSTANCE_ID),
            spec: Some(spec),
            process: Some(process),
            id_maps,
            cgroup_path,
            init_pid: None,
        }
    }

    /// Starts the container process and returns its pid. On return the
    /// process has passed its exec, so a stuck rootfs setup cannot leave
    /// the supervisor without a pid to act on.
    pub fn run(&mut self) -> Result<Pid> {
        let payload = InitPayload {
            spec: self.spec.take().expect("container started twice"),
            process: self.process.take().expect("container started twice"),
        };

        let (mut payload_tx, payload_rx) = channel::<InitPayload>()?;
        let (sync_tx, mut sync_rx) = channel::<SyncMessage>()?;
        let (mut ack_tx, ack_rx) = channel::<AckMessage>()?;

        // The child only execs; argv and envp are prepared ahead of the fork.
        let argv = trampoline_argv();
        let envp = trampoline_envp(&payload_rx, &sync_tx, &ack_rx);

        let intermediate = match unsafe { fork() }.map_err(ContainerError::Fork)? {
            ForkResult::Child => {
                drop(payload_tx);
                drop(sync_rx);
                drop(ack_tx);

                let _ = nix::unistd::execve::<CString, CString>(
                    &argv[0],
                    &argv[1..],
                    &envp,
                );
                // Nothing sensible left to do without an exec'd trampoline.
                std::process::exit(127);
            }
            ForkResult::Parent { child } => child,
        };

        drop(payload_rx);
        drop(ack_rx);

        // The payload write below doubles as the gate that keeps the
        // trampoline from racing ahead of the cgroup placement.
        cgroup::add_process(&self.cgroup_path, intermediate)?;
        payload_tx.send(&payload)?;
        drop(payload_tx);

        if let Some(maps) = &self.id_maps {
            match sync_rx.recv()? {
                SyncMessage::WriteMapping => {}
                SyncMessage::Error { message } => return Err(ContainerError::Start(message)),
                message => {
                    return Err(ContainerError::UnexpectedMessage {
                        expected: "write_mapping",
                        received: message.name(),
                    })
                }
            }

            user_ns::write_mappings(intermediate, maps)
                .map_err(|source| ContainerError::IdMap { pid: intermediate, source })?;
            ack_tx.send(&AckMessage::MappingWritten)?;
        }

        let init_pid = match sync_rx.recv()? {
            SyncMessage::InitPid { pid } => Pid::from_raw(pid),
            SyncMessage::Error { message } => return Err(ContainerError::Start(message)),
            message => {
                return Err(ContainerError::UnexpectedMessage {
                    expected: "init_pid",
                    received: message.name(),
                })
            }
        };

        // The intermediate has served its purpose; reap it so it does not
        // linger as a zombie while the container runs.
        let _ = waitpid(intermediate, None);

        // End of channel means the init process reached its exec; anything
        // else is a setup failure.
        match sync_rx.recv_or_eof()? {
            None => {}
            Some(SyncMessage::Error { message }) => return Err(ContainerError::Start(message)),
            Some(message) => {
                return Err(ContainerError::UnexpectedMessage {
                    expected: "exec",
                    received: message.name(),
                })
            }
        }

        debug!("container {} started with init pid {init_pid}", self.id);
        self.init_pid = Some(init_pid);
        Ok(init_pid)
    }

    /// Sends SIGKILL to every process of the container.
    pub fn signal_all(&self) -> std::result::Result<(), CgroupError> {
        cgroup::kill_all(&self.cgroup_path)
    }

    /// Waits for the init process. Stop states are reported, the pid is
    /// released once the process is gone for good.
    pub fn wait(&mut self) -> Result<WaitStatus> {
        let pid = self.init_pid.ok_or(ContainerError::NotRunning)?;

        loop {
            match waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(ContainerError::Wait(err)),
                Ok(status) => {
                    if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
                        self.init_pid = None;
                    }
                    return Ok(status);
                }
            }
        }
    }

    /// Best-effort destruction: kill whatever is left in the cgroup and
    /// reap a still-pending init process.
    pub fn destroy(&mut self) {
        if let Err(err) = self.signal_all() {
            debug!("failed to signal the container cgroup during destroy: {err}");
        }

        if let Some(pid) = self.init_pid.take() {
            match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(err) => warn!("failed to kill the container init process {pid}: {err}"),
            }
            let _ = waitpid(pid, None);
        }
    }
}

fn trampoline_argv() -> Vec<CString> {
    vec![
        CString::new("/proc/self/exe").expect("static argv"),
        CString::new("runj").expect("static argv"),
        CString::new(INIT_ARG).expect("static argv"),
    ]
}

/// The inherited environment plus the fd numbers of the three channels.
/// Built before the fork so the child does nothing but exec.
fn trampoline_envp(
    payload_rx: &Receiver<InitPayload>,
    sync_tx: &Sender<SyncMessage>,
    ack_rx: &Receiver<AckMessage>,
) -> Vec<CString> {
    let mut envp: Vec<CString> = std::env::vars()
        .filter_map(|(key, value)| CString::new(format!("{key}={value}")).ok())
        .collect();

    // The raw fds stay open across the fork and exec because the pipes are
    // created without close-on-exec.
    envp.push(
        CString::new(format!("{INIT_PIPE_ENV}={}", payload_rx.as_fd_number()))
            .expect("fd number env"),
    );
    envp.push(
        CString::new(format!("{SYNC_PIPE_ENV}={}", sync_tx.as_fd_number())).expect("fd number env"),
    );
    envp.push(
        CString::new(format!("{ACK_PIPE_ENV}={}", ack_rx.as_fd_number())).expect("fd number env"),
    );

    envp
}
