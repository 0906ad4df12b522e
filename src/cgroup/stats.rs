use std::collections::HashMap;
use std::path::Path;

use super::{read_cgroup_file, CgroupError};

const CPU_STAT: &str = "cpu.stat";
const MEMORY_PEAK: &str = "memory.peak";
const MEMORY_CURRENT: &str = "memory.current";
const MEMORY_SWAP_PEAK: &str = "memory.swap.peak";
const MEMORY_SWAP_CURRENT: &str = "memory.swap.current";
const MEMORY_EVENTS: &str = "memory.events";

type Result<T> = std::result::Result<T, CgroupError>;

/// Cgroup accounting snapshot taken after the container process has been
/// reaped, so the values cover its full lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct CgroupStats {
    pub cpu_user_ms: u64,
    pub cpu_kernel_ms: u64,
    pub memory_usage_kib: u64,
}

pub fn collect(cgroup_path: &Path) -> Result<CgroupStats> {
    let cpu = parse_flat_keyed_file(cgroup_path, CPU_STAT)?;
    let require = |field: &str| {
        cpu.get(field).copied().ok_or_else(|| CgroupError::Parse {
            path: cgroup_path.join(CPU_STAT),
            line: format!("missing field {field}"),
        })
    };

    // cpu.stat reports microseconds.
    let cpu_user_ms = require("user_usec")? / 1000;
    let cpu_kernel_ms = require("system_usec")? / 1000;

    let memory = single_value_with_fallback(cgroup_path, MEMORY_PEAK, MEMORY_CURRENT)?;
    // Swap accounting files only exist on hosts with swap enabled.
    let swap =
        single_value_with_fallback(cgroup_path, MEMORY_SWAP_PEAK, MEMORY_SWAP_CURRENT).unwrap_or(0);

    Ok(CgroupStats {
        cpu_user_ms,
        cpu_kernel_ms,
        memory_usage_kib: (memory + swap) / 1024,
    })
}

/// Whether the kernel OOM killer fired inside this cgroup. The counter is
/// parsed as a number; a plain byte comparison would break once it passes 9.
pub fn oom_killed(cgroup_path: &Path) -> Result<bool> {
    let events = parse_flat_keyed_file(cgroup_path, MEMORY_EVENTS)?;
    Ok(events.get("oom_kill").copied().unwrap_or(0) > 0)
}

fn single_value_with_fallback(cgroup_path: &Path, name: &str, fallback: &str) -> Result<u64> {
    match parse_single_value(cgroup_path, name) {
        Ok(value) => Ok(value),
        Err(_) => parse_single_value(cgroup_path, fallback),
    }
}

fn parse_single_value(cgroup_path: &Path, name: &str) -> Result<u64> {
    let path = cgroup_path.join(name);
    let content = read_cgroup_file(&path)?;
    content
        .trim()
        .parse()
        .map_err(|_| CgroupError::Parse { path, line: content.trim().to_string() })
}

/// Parses files in the flat keyed format, `KEY VALUE` per line.
fn parse_flat_keyed_file(cgroup_path: &Path, name: &str) -> Result<HashMap<String, u64>> {
    let path = cgroup_path.join(name);
    let content = read_cgroup_file(&path)?;

    content
        .lines()
        .map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(key), Some(value)) => {
                    let value = value.parse().map_err(|_| CgroupError::Parse {
                        path: path.clone(),
                        line: line.to_string(),
                    })?;
                    Ok((key.to_string(), value))
                }
                _ => Err(CgroupError::Parse { path: path.clone(), line: line.to_string() }),
            }
        })
        .collect()
}
