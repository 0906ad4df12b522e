use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

use crate::cgroup::stats::CgroupStats;
use crate::report::{ExecutionReport, ExecutionStatus};

/// Everything the classification rules are allowed to look at.
#[derive(Debug)]
pub struct ClassifyContext {
    pub wait_status: WaitStatus,
    pub stats: CgroupStats,
    pub oom_killed: bool,
    pub wall_time: Duration,
    /// Whether the timeout watcher reached its deadline before the process
    /// finished. Tells a wall TLE apart from a natural exit racing it.
    pub wall_timeout_fired: bool,
    pub wall_budget_ms: u64,
    pub kernel_limit_ms: u64,
    pub user_limit_ms: u64,
    /// The configured fsize hard limit, without the +1 the kernel rule got.
    pub fsize_threshold: u64,
    pub stdout_size: Option<u64>,
    pub stderr_size: Option<u64>,
}

/// Reconciles the wait status with the auxiliary evidence. The wait status
/// seeds the report, then each rule may override the status; later rules
/// win because their evidence is the more authoritative one.
pub fn classify(ctx: &ClassifyContext) -> ExecutionReport {
    let seed = seed_from_wait_status(ctx.wait_status);

    const RULES: [fn(&ClassifyContext) -> Option<ExecutionStatus>; 3] =
        [time_rule, output_rule, oom_rule];
    let status =
        RULES.iter().fold(seed.status, |status, rule| rule(ctx).unwrap_or(status));

    ExecutionReport {
        status,
        exit_code: seed.exit_code,
        signal: seed.signal,
        wall_time_ms: ctx.wall_time.as_millis() as u64,
        cpu_user_time_ms: ctx.stats.cpu_user_ms,
        cpu_kernel_time_ms: ctx.stats.cpu_kernel_ms,
        memory_usage_kib: ctx.stats.memory_usage_kib,
    }
}

struct Seed {
    status: ExecutionStatus,
    exit_code: i32,
    signal: Option<String>,
}

fn seed_from_wait_status(wait_status: WaitStatus) -> Seed {
    match wait_status {
        WaitStatus::Exited(_, 0) => {
            Seed { status: ExecutionStatus::Normal, exit_code: 0, signal: None }
        }
        WaitStatus::Exited(_, code) => {
            Seed { status: ExecutionStatus::RuntimeError, exit_code: code, signal: None }
        }
        WaitStatus::Signaled(_, signal, _) => {
            let status = match signal {
                Signal::SIGXCPU => ExecutionStatus::UserTimeLimitExceeded,
                Signal::SIGXFSZ => ExecutionStatus::OutputLimitExceeded,
                _ => ExecutionStatus::SignalTerminate,
            };
            Seed { status, exit_code: 128 + signal as i32, signal: Some(signal_name(signal)) }
        }
        WaitStatus::Stopped(_, signal) => Seed {
            status: ExecutionStatus::SignalStop,
            exit_code: 128 + signal as i32,
            signal: Some(signal_name(signal)),
        },
        _ => Seed { status: ExecutionStatus::Unknown, exit_code: -1, signal: None },
    }
}

fn signal_name(signal: Signal) -> String {
    signal.as_str().trim_start_matches("SIG").to_string()
}

/// Time reconciliation. SIGXCPU cannot always terminate a spinning process
/// and the deadline SIGKILL masks the cause, so the recorded times get the
/// final say. Active only when a time budget was configured at all.
fn time_rule(ctx: &ClassifyContext) -> Option<ExecutionStatus> {
    if ctx.wall_budget_ms == 0 {
        return None;
    }

    let mut status = None;
    if ctx.wall_timeout_fired {
        status = Some(ExecutionStatus::WallTimeLimitExceeded);
    }
    if ctx.kernel_limit_ms > 0 && ctx.stats.cpu_kernel_ms > ctx.kernel_limit_ms {
        status = Some(ExecutionStatus::SystemTimeLimitExceeded);
    }
    if ctx.user_limit_ms > 0 && ctx.stats.cpu_user_ms > ctx.user_limit_ms {
        status = Some(ExecutionStatus::UserTimeLimitExceeded);
    }

    status
}

/// Output reconciliation. SIGXFSZ can be preempted by the deadline SIGKILL,
/// so the sizes of the output files are the authoritative source.
fn output_rule(ctx: &ClassifyContext) -> Option<ExecutionStatus> {
    if ctx.fsize_threshold == 0 {
        return None;
    }

    let over = |size: Option<u64>| size.map(|size| size > ctx.fsize_threshold).unwrap_or(false);
    if over(ctx.stdout_size) || over(ctx.stderr_size) {
        return Some(ExecutionStatus::OutputLimitExceeded);
    }

    None
}

/// An OOM kill arrives as a plain signal; the cgroup counter is what proves
/// the memory limit fired, overriding everything before it.
fn oom_rule(ctx: &ClassifyContext) -> Option<ExecutionStatus> {
    ctx.oom_killed.then_some(ExecutionStatus::MemoryLimitExceeded)
}
