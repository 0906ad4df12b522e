use std::path::Path;

use oci_spec::runtime::{LinuxCpu, LinuxMemory, LinuxPids, LinuxResources};
use tracing::debug;

use super::{write_cgroup_file, CgroupError};

const CGROUP_CPU_WEIGHT: &str = "cpu.weight";
const CGROUP_CPU_MAX: &str = "cpu.max";
const CGROUP_CPUSET_CPUS: &str = "cpuset.cpus";
const CGROUP_CPUSET_MEMS: &str = "cpuset.mems";
const CGROUP_MEMORY_MAX: &str = "memory.max";
const CGROUP_MEMORY_SWAP: &str = "memory.swap.max";
const CGROUP_MEMORY_LOW: &str = "memory.low";
const CGROUP_PIDS_MAX: &str = "pids.max";

const MAX_CPU_WEIGHT: u64 = 10000;

type Result<T> = std::result::Result<T, CgroupError>;

/// Applies the synthesized resource rules to the container cgroup.
pub fn apply(cgroup_path: &Path, resources: &LinuxResources) -> Result<()> {
    if let Some(cpu) = resources.cpu().as_ref() {
        apply_cpu(cgroup_path, cpu)?;
        apply_cpuset(cgroup_path, cpu)?;
    }

    if let Some(memory) = resources.memory().as_ref() {
        apply_memory(cgroup_path, memory)?;
    }

    if let Some(pids) = resources.pids().as_ref() {
        apply_pids(cgroup_path, pids)?;
    }

    Ok(())
}

fn apply_cpu(path: &Path, cpu: &LinuxCpu) -> Result<()> {
    if let Some(shares) = cpu.shares() {
        let weight = convert_shares_to_cgroup2(shares);
        // Zero would be rejected by the kernel with ERANGE.
        if weight != 0 {
            write_cgroup_file(path.join(CGROUP_CPU_WEIGHT), weight.to_string())?;
        }
    }

    // The format is 'quota period'; a non-positive quota means unrestricted.
    if let Some(quota) = cpu.quota() {
        let quota = if quota > 0 { quota.to_string() } else { "max".to_string() };
        write_cgroup_file(path.join(CGROUP_CPU_MAX), quota)?;
    }

    Ok(())
}

fn apply_cpuset(path: &Path, cpu: &LinuxCpu) -> Result<()> {
    if let Some(cpus) = cpu.cpus().as_ref() {
        write_cgroup_file(path.join(CGROUP_CPUSET_CPUS), cpus)?;
    }

    if let Some(mems) = cpu.mems().as_ref() {
        write_cgroup_file(path.join(CGROUP_CPUSET_MEMS), mems)?;
    }

    Ok(())
}

fn apply_memory(path: &Path, memory: &LinuxMemory) -> Result<()> {
    if let Some(limit) = memory.limit() {
        match memory.swap() {
            // The rules carry mem+swap totals, the v2 knob takes swap
            // alone. Zero is written out: swap == limit means no swap.
            Some(swap) if swap != -1 && limit != -1 => {
                let converted = swap.saturating_sub(limit).max(0);
                write_cgroup_file(path.join(CGROUP_MEMORY_SWAP), converted.to_string())?;
            }
            Some(swap) => set_memory_value(path.join(CGROUP_MEMORY_SWAP), swap)?,
            None => {}
        }

        set_memory_value(path.join(CGROUP_MEMORY_MAX), limit)?;
    }

    if let Some(reservation) = memory.reservation() {
        set_memory_value(path.join(CGROUP_MEMORY_LOW), reservation)?;
    }

    if memory.swappiness().is_some() {
        // There is no swappiness knob on the unified hierarchy.
        debug!("ignoring memory swappiness on cgroup v2");
    }

    Ok(())
}

fn apply_pids(path: &Path, pids: &LinuxPids) -> Result<()> {
    let limit = if pids.limit() > 0 { pids.limit().to_string() } else { "max".to_string() };
    write_cgroup_file(path.join(CGROUP_PIDS_MAX), limit)
}

fn set_memory_value(path: impl AsRef<Path>, value: i64) -> Result<()> {
    if value == 0 {
        return Ok(());
    }

    if value == -1 {
        return write_cgroup_file(path, "max");
    }

    write_cgroup_file(path, value.to_string())
}

/// Maps the v1 shares range [2, 262144] onto the v2 weight range [1, 10000].
fn convert_shares_to_cgroup2(shares: u64) -> u64 {
    if shares == 0 {
        return 0;
    }

    let weight = 1 + ((shares.saturating_sub(2)).saturating_mul(9999)) / 262142;
    weight.min(MAX_CPU_WEIGHT)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use oci_spec::runtime::{
        LinuxCpuBuilder, LinuxMemoryBuilder, LinuxPidsBuilder, LinuxResourcesBuilder,
    };

    use super::*;

    #[test]
    fn test_convert_shares_to_cgroup2() {
        assert_eq!(convert_shares_to_cgroup2(0), 0);
        assert_eq!(convert_shares_to_cgroup2(2), 1);
        assert_eq!(convert_shares_to_cgroup2(1024), 39);
        assert_eq!(convert_shares_to_cgroup2(262144), 10000);
        assert_eq!(convert_shares_to_cgroup2(u64::MAX), 10000);
    }

    #[test]
    fn test_apply_writes_expected_files() {
        let dir = tempfile::tempdir().unwrap();

        let resources = LinuxResourcesBuilder::default()
            .cpu(
                LinuxCpuBuilder::default()
                    .shares(1024u64)
                    .quota(50000i64)
                    .cpus("0-1")
                    .build()
                    .unwrap(),
            )
            .memory(
                LinuxMemoryBuilder::default()
                    .limit(16 * 1024 * 1024i64)
                    .swap(16 * 1024 * 1024i64)
                    .swappiness(0u64)
                    .build()
                    .unwrap(),
            )
            .pids(LinuxPidsBuilder::default().limit(64i64).build().unwrap())
            .build()
            .unwrap();

        apply(dir.path(), &resources).unwrap();

        let read = |name: &str| fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("cpu.weight"), "39");
        assert_eq!(read("cpu.max"), "50000");
        assert_eq!(read("cpuset.cpus"), "0-1");
        assert_eq!(read("memory.max"), (16 * 1024 * 1024).to_string());
        assert_eq!(read("pids.max"), "64");

        // swap equals the limit, so the v2 swap allowance collapses to
        // zero: no swap for the container.
        assert_eq!(read("memory.swap.max"), "0");
    }

    #[test]
    fn test_apply_memory_swap_conversion() {
        let dir = tempfile::tempdir().unwrap();

        let memory = LinuxMemoryBuilder::default()
            .limit(64 * 1024 * 1024i64)
            .swap(96 * 1024 * 1024i64)
            .build()
            .unwrap();
        apply_memory(dir.path(), &memory).unwrap();

        let swap = fs::read_to_string(dir.path().join("memory.swap.max")).unwrap();
        assert_eq!(swap, (32 * 1024 * 1024).to_string());
    }

    #[test]
    fn test_apply_pids_unlimited() {
        let dir = tempfile::tempdir().unwrap();

        let pids = LinuxPidsBuilder::default().limit(0i64).build().unwrap();
        apply_pids(dir.path(), &pids).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("pids.max")).unwrap(), "max");
    }
}
