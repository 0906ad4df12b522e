use std::fs::{self, File};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{SigSet, Signal};
use nix::unistd::{close, dup, dup2};
use tracing::{debug, warn};

use crate::cgroup::{self, ProvisionedCgroup};
use crate::config::{RlimitKind, RlimitRule, RunjConfig};
use crate::container::{Container, ContainerProcess};
use crate::overlayfs;
use crate::report::ExecutionReport;
use crate::spec;
use crate::user_ns;

pub mod classify;

const STANDARD_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const DEFAULT_RLIMIT_FSIZE: u64 = 256 * 1024 * 1024;
const DEFAULT_RLIMIT_NOFILE: u64 = 256;
const DEFAULT_RLIMIT_CORE: u64 = 0;

/// The deadline watcher fires at twice the configured budget, leaving the
/// process room to be killed by its CPU limits first.
const TIME_BUDGET_FACTOR: u64 = 2;

const NOBODY_UID: u32 = 65534;
const NOBODY_GID: u32 = 65534;

type FinishedEvent = Arc<(Mutex<bool>, Condvar)>;

/// Runs the configured container to completion and produces the report.
/// The cgroup directories are removed on every exit path.
pub fn execute(config: &RunjConfig) -> Result<ExecutionReport> {
    // The overlay descriptor has to reach the environment before any
    // watcher thread exists.
    if let Some(overlay) = &config.overlayfs {
        overlayfs::check(overlay).context("Error validating the overlayfs directories")?;
        overlayfs::publish_to_env(overlay);
    }

    let id_maps = match &config.user_namespace {
        Some(user_namespace) if user_namespace.enabled() => Some(
            user_ns::resolve(user_namespace).context("Error preparing the id mappings")?,
        ),
        _ => None,
    };

    let container_spec = spec::make_container_spec(config, id_maps.as_ref())
        .context("Error making the container specification")?;

    let cgroup = cgroup::provision(config).context("Error preparing the container cgroup")?;
    let result = supervise(config, container_spec, id_maps, &cgroup);
    cgroup.teardown();

    result
}

fn supervise(
    config: &RunjConfig,
    container_spec: oci_spec::runtime::Spec,
    id_maps: Option<user_ns::ResolvedIdMaps>,
    cgroup: &ProvisionedCgroup,
) -> Result<ExecutionReport> {
    if let Some(resources) =
        container_spec.linux().as_ref().and_then(|linux| linux.resources().as_ref())
    {
        cgroup::resources::apply(&cgroup.container, resources)
            .context("Error applying the cgroup resource rules")?;
    }

    let stdin_path = fd_path(config, |fd| fd.stdin.as_ref());
    let stdin_file = File::open(&stdin_path)
        .with_context(|| format!("Error opening the stdin file {}", stdin_path.display()))?;

    let stdout_path = fd_path(config, |fd| fd.stdout.as_ref());
    let stdout_file = crate::utils::prepare_out_file(&stdout_path)
        .with_context(|| format!("Error preparing the stdout file {}", stdout_path.display()))?;

    let stderr_path = fd_path(config, |fd| fd.stderr.as_ref());
    let stderr_file = crate::utils::prepare_out_file(&stderr_path)
        .with_context(|| format!("Error preparing the stderr file {}", stderr_path.display()))?;

    let (rlimits, fsize_threshold) =
        assemble_rlimits(config).context("Error assembling the rlimit rules")?;

    let process = ContainerProcess {
        args: config.command.clone(),
        env: vec![build_path_env(&config.paths)],
        cwd: config.cwd.clone(),
        uid: NOBODY_UID,
        gid: NOBODY_GID,
        rlimits,
        no_new_privileges: true,
    };

    let mut container =
        Container::create(container_spec, process, id_maps, cgroup.container.clone());

    let finished: FinishedEvent = Arc::new((Mutex::new(false), Condvar::new()));
    let deadline_fired = Arc::new(AtomicBool::new(false));
    let cancelled = Arc::new(AtomicBool::new(false));

    let wall_budget_ms = config.limits.wall_budget_ms();
    let wall_time_begin = Instant::now();

    // Both watchers are armed before the container starts so even a stuck
    // init can still be killed and a shutdown request is never missed.
    if wall_budget_ms > 0 {
        spawn_timeout_watcher(
            finished.clone(),
            deadline_fired.clone(),
            cgroup.container.clone(),
            Duration::from_millis(wall_budget_ms.saturating_mul(TIME_BUDGET_FACTOR)),
        );
    }
    spawn_cancellation_watcher(finished.clone(), cancelled.clone(), cgroup.container.clone());

    let run_result = match StdioGuard::redirect(&stdin_file, &stdout_file, &stderr_file) {
        Ok(_stdio) => container.run().map_err(anyhow::Error::from),
        Err(err) => Err(err.context("Error redirecting the stdio files")),
    };
    if let Err(err) = run_result {
        set_finished(&finished);
        container.destroy();
        return Err(err.context("Error starting the container process"));
    }

    let wait_result = container.wait();
    let wall_time = wall_time_begin.elapsed();

    // The deadline flag is captured before the finished event is published,
    // otherwise a wall TLE racing a natural exit would be unclassifiable.
    let wall_timeout_fired = deadline_fired.load(Ordering::SeqCst);
    set_finished(&finished);

    let wait_status = match wait_result {
        Ok(status) => status,
        Err(err) => {
            container.destroy();
            return Err(err).context("Error waiting for the container process");
        }
    };

    if cancelled.load(Ordering::SeqCst) {
        container.destroy();
        bail!("Cancelled");
    }

    // Snapshot the accounting only after the reap so it covers the whole
    // lifetime of the process tree.
    let stats = cgroup::stats::collect(&cgroup.container)
        .context("Error reading the container cgroup statistics");
    let oom_killed = cgroup::stats::oom_killed(&cgroup.container)
        .context("Error checking the container oom status");

    drop(stdin_file);
    drop(stdout_file);
    drop(stderr_file);

    let (stats, oom_killed) = match (stats, oom_killed) {
        (Ok(stats), Ok(oom_killed)) => (stats, oom_killed),
        (Err(err), _) | (_, Err(err)) => {
            container.destroy();
            return Err(err);
        }
    };

    let stdout_size = configured_output_size(config, |fd| fd.stdout.as_ref())
        .context("Error checking the stdout file length")?;
    let stderr_size = configured_output_size(config, |fd| fd.stderr.as_ref())
        .context("Error checking the stderr file length")?;

    let report = classify::classify(&classify::ClassifyContext {
        wait_status,
        stats,
        oom_killed,
        wall_time,
        wall_timeout_fired,
        wall_budget_ms,
        kernel_limit_ms: config.limits.kernel_limit_ms(),
        user_limit_ms: config.limits.user_limit_ms(),
        fsize_threshold,
        stdout_size,
        stderr_size,
    });

    container.destroy();
    Ok(report)
}

fn fd_path<'a>(
    config: &'a RunjConfig,
    pick: impl Fn(&'a crate::config::FdConfig) -> Option<&'a PathBuf>,
) -> PathBuf {
    config
        .fd
        .as_ref()
        .and_then(pick)
        .cloned()
        .unwrap_or_else(|| PathBuf::from("/dev/null"))
}

/// The size of an output file, but only when the job asked for one; the
/// /dev/null default never counts against the output limit.
fn configured_output_size(
    config: &RunjConfig,
    pick: impl for<'a> Fn(&'a crate::config::FdConfig) -> Option<&'a PathBuf>,
) -> Result<Option<u64>> {
    match config.fd.as_ref().and_then(pick) {
        Some(path) => {
            let metadata = fs::metadata(path)
                .with_context(|| format!("Error inspecting {}", path.display()))?;
            Ok(Some(metadata.len()))
        }
        None => Ok(None),
    }
}

/// Overlays the configured rlimit rules onto the defaults. The FSIZE rule
/// is raised by one byte so the kernel delivers SIGXFSZ at the configured
/// threshold instead of one byte past it; the configured value is returned
/// as the classification threshold.
fn assemble_rlimits(config: &RunjConfig) -> Result<(Vec<RlimitRule>, u64)> {
    let mut rules = config.limits.rlimit.resolve()?;

    let mut fsize_threshold = 0;
    for rule in &mut rules {
        if rule.kind == RlimitKind::Fsize {
            fsize_threshold = rule.hard;
            rule.hard += 1;
            rule.soft += 1;
        }
    }

    let defaults = [
        RlimitRule { kind: RlimitKind::Fsize, hard: DEFAULT_RLIMIT_FSIZE, soft: DEFAULT_RLIMIT_FSIZE },
        RlimitRule { kind: RlimitKind::Nofile, hard: DEFAULT_RLIMIT_NOFILE, soft: DEFAULT_RLIMIT_NOFILE },
        RlimitRule { kind: RlimitKind::Core, hard: DEFAULT_RLIMIT_CORE, soft: DEFAULT_RLIMIT_CORE },
    ];
    for default in defaults {
        if rules.iter().all(|rule| rule.kind != default.kind) {
            rules.push(default);
        }
    }

    Ok((rules, fsize_threshold))
}

fn build_path_env(paths: &[String]) -> String {
    if paths.is_empty() {
        return format!("PATH={STANDARD_PATH}");
    }

    format!("PATH={STANDARD_PATH}:{}", paths.join(":"))
}

fn spawn_timeout_watcher(
    finished: FinishedEvent,
    deadline_fired: Arc<AtomicBool>,
    cgroup_path: PathBuf,
    deadline: Duration,
) {
    thread::spawn(move || {
        let (lock, condvar) = &*finished;
        let guard = lock.lock().expect("finished event poisoned");
        let (guard, _) = condvar
            .wait_timeout_while(guard, deadline, |done| !*done)
            .expect("finished event poisoned");
        if *guard {
            return;
        }
        drop(guard);

        // The flag goes up before the kill so the classifier can attribute
        // the SIGKILL it is about to observe.
        deadline_fired.store(true, Ordering::SeqCst);
        debug!("wall clock budget exhausted, killing the container");
        if let Err(err) = cgroup::kill_all(&cgroup_path) {
            warn!("failed to kill the container after the deadline: {err}");
        }
    });
}

fn spawn_cancellation_watcher(
    finished: FinishedEvent,
    cancelled: Arc<AtomicBool>,
    cgroup_path: PathBuf,
) {
    thread::spawn(move || {
        let mut signals = SigSet::empty();
        signals.add(Signal::SIGINT);
        signals.add(Signal::SIGTERM);

        loop {
            match signals.wait() {
                Ok(_) => {
                    if *finished.0.lock().expect("finished event poisoned") {
                        return;
                    }

                    cancelled.store(true, Ordering::SeqCst);
                    warn!("sending SIGKILL to the running container, runj is shutting down");
                    if let Err(err) = cgroup::kill_all(&cgroup_path) {
                        warn!("failed to kill the container during shutdown: {err}");
                    }
                    return;
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    warn!("failed to wait for shutdown signals: {err}");
                    return;
                }
            }
        }
    });
}

fn set_finished(finished: &FinishedEvent) {
    let (lock, condvar) = &**finished;
    *lock.lock().expect("finished event poisoned") = true;
    condvar.notify_all();
}

/// Temporarily routes fds 0/1/2 at the container's stdio files so the
/// cloned process inherits them; the originals come back when the guard
/// drops. The backups are close-on-exec, the container never sees the
/// supervisor's real stdout.
struct StdioGuard {
    saved: Vec<(RawFd, RawFd)>,
}

impl StdioGuard {
    fn redirect(stdin: &File, stdout: &File, stderr: &File) -> Result<Self> {
        let mut guard = Self { saved: Vec::with_capacity(3) };

        for (file, target) in [(stdin, 0), (stdout, 1), (stderr, 2)] {
            let backup = dup(target).context("Error saving a stdio fd")?;
            fcntl(backup, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .context("Error marking a stdio backup close-on-exec")?;
            guard.saved.push((backup, target));

            dup2(file.as_raw_fd(), target).context("Error redirecting a stdio fd")?;
        }

        Ok(guard)
    }
}

impl Drop for StdioGuard {
    fn drop(&mut self) {
        for (backup, target) in self.saved.drain(..) {
            let _ = dup2(backup, target);
            let _ = close(backup);
        }
    }
}
