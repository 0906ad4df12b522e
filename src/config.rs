use std::collections::BTreeMap;
use std::path::PathBuf;

use nix::sys::resource::Resource;
use serde::{Deserialize, Serialize};

use crate::overlayfs::OverlayfsConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("the command must be a non-empty sequence of non-empty strings")]
    EmptyCommand,
    #[error("exactly one of `rootfs` and `overlayfs` must be provided")]
    AmbiguousRoot,
    #[error("`cwd` must be an absolute path inside the container")]
    RelativeCwd,
    #[error("unknown rlimit type: {0}")]
    UnknownRlimit(String),
}

/// The job description. Parsed once from the input document and immutable
/// afterwards.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunjConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlayfs: Option<OverlayfsConfig>,

    pub cwd: PathBuf,

    pub command: Vec<String>,

    /// Extra entries appended to the container's PATH.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub paths: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fd: Option<FdConfig>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub mounts: Vec<MountConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_namespace: Option<UserNamespaceConfig>,

    /// Parent directory under the unified cgroup mount. When present the
    /// provisioner always uses the cgroupfs backend below it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup_path: Option<PathBuf>,

    /// Widen bind-mount sources to 0777 when their options contain `exec`.
    /// This mutates the host filesystem, hence off by default.
    #[serde(default)]
    pub chmod_exec: bool,

    #[serde(default)]
    pub limits: LimitsConfig,
}

impl RunjConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.is_empty() || self.command.iter().any(|part| part.is_empty()) {
            return Err(ConfigError::EmptyCommand);
        }

        if self.rootfs.is_some() == self.overlayfs.is_some() {
            return Err(ConfigError::AmbiguousRoot);
        }

        if !self.cwd.is_absolute() {
            return Err(ConfigError::RelativeCwd);
        }

        self.limits.rlimit.resolve().map(|_| ())
    }

    pub fn user_namespace_enabled(&self) -> bool {
        self.user_namespace.as_ref().map(|config| config.enabled()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FdConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MountConfig {
    pub from: PathBuf,
    pub to: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// The two accepted user namespace shapes. Both normalize into plain
/// id-mapping rows early, see the `user_ns` module.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum UserNamespaceConfig {
    MapToRange {
        enabled: bool,
        root_uid: u32,
        uid_map_begin: u32,
        uid_map_count: u32,
        root_gid: u32,
        gid_map_begin: u32,
        gid_map_count: u32,
    },
    MapToName {
        enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        map_to_user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        map_to_group: Option<String>,
    },
}

impl UserNamespaceConfig {
    pub fn enabled(&self) -> bool {
        match self {
            Self::MapToRange { enabled, .. } => *enabled,
            Self::MapToName { enabled, .. } => *enabled,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Overall wall clock budget. Takes precedence over the fine-grained
    /// `time` rules when both are present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeLimitsConfig>,

    #[serde(default)]
    pub cgroup: CgroupConfig,

    #[serde(default)]
    pub rlimit: RlimitConfig,
}

impl LimitsConfig {
    /// The wall clock budget the timeout watcher enforces. Zero disables the
    /// watcher.
    pub fn wall_budget_ms(&self) -> u64 {
        if let Some(time_ms) = self.time_ms {
            return time_ms;
        }

        match &self.time {
            Some(time) if time.wall > 0 => time.wall,
            Some(time) => time.kernel + time.user,
            None => 0,
        }
    }

    pub fn kernel_limit_ms(&self) -> u64 {
        self.time.as_ref().map(|time| time.kernel).unwrap_or(0)
    }

    pub fn user_limit_ms(&self) -> u64 {
        self.time.as_ref().map(|time| time.user).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TimeLimitsConfig {
    #[serde(default)]
    pub wall: u64,
    #[serde(default)]
    pub kernel: u64,
    #[serde(default)]
    pub user: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CgroupConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_reservation: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_swap: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub swappiness: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpuset_cpus: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpuset_mems: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<i64>,
}

/// Rlimit rules keyed by name. `core`, `fsize` and `no_file` carry defaults
/// and are first-class; anything else goes through the flattened map and is
/// resolved against the full rlimit table.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RlimitConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core: Option<RlimitItem>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fsize: Option<RlimitItem>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_file: Option<RlimitItem>,

    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, RlimitItem>,
}

impl RlimitConfig {
    /// Normalizes the map into typed rules, rejecting unknown names.
    pub fn resolve(&self) -> Result<Vec<RlimitRule>, ConfigError> {
        let mut rules = Vec::new();

        if let Some(item) = &self.core {
            rules.push(RlimitRule { kind: RlimitKind::Core, hard: item.hard, soft: item.soft });
        }
        if let Some(item) = &self.fsize {
            rules.push(RlimitRule { kind: RlimitKind::Fsize, hard: item.hard, soft: item.soft });
        }
        if let Some(item) = &self.no_file {
            rules.push(RlimitRule { kind: RlimitKind::Nofile, hard: item.hard, soft: item.soft });
        }

        for (name, item) in &self.extra {
            let kind = RlimitKind::from_name(name)
                .ok_or_else(|| ConfigError::UnknownRlimit(name.clone()))?;
            rules.push(RlimitRule { kind, hard: item.hard, soft: item.soft });
        }

        Ok(rules)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RlimitItem {
    pub hard: u64,
    pub soft: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RlimitKind {
    As,
    Core,
    Cpu,
    Data,
    Fsize,
    Locks,
    Memlock,
    Msgqueue,
    Nice,
    Nofile,
    Nproc,
    Rss,
    Rtprio,
    Rttime,
    Sigpending,
    Stack,
}

impl RlimitKind {
    /// Accepts names like `cpu`, `no_file`, `RLIMIT_NOFILE`.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.to_ascii_uppercase();
        let normalized = normalized.strip_prefix("RLIMIT_").unwrap_or(&normalized);

        Some(match normalized.replace('_', "").as_str() {
            "AS" => Self::As,
            "CORE" => Self::Core,
            "CPU" => Self::Cpu,
            "DATA" => Self::Data,
            "FSIZE" => Self::Fsize,
            "LOCKS" => Self::Locks,
            "MEMLOCK" => Self::Memlock,
            "MSGQUEUE" => Self::Msgqueue,
            "NICE" => Self::Nice,
            "NOFILE" => Self::Nofile,
            "NPROC" => Self::Nproc,
            "RSS" => Self::Rss,
            "RTPRIO" => Self::Rtprio,
            "RTTIME" => Self::Rttime,
            "SIGPENDING" => Self::Sigpending,
            "STACK" => Self::Stack,
            _ => return None,
        })
    }

    pub fn resource(self) -> Resource {
        match self {
            Self::As => Resource::RLIMIT_AS,
            Self::Core => Resource::RLIMIT_CORE,
            Self::Cpu => Resource::RLIMIT_CPU,
            Self::Data => Resource::RLIMIT_DATA,
            Self::Fsize => Resource::RLIMIT_FSIZE,
            Self::Locks => Resource::RLIMIT_LOCKS,
            Self::Memlock => Resource::RLIMIT_MEMLOCK,
            Self::Msgqueue => Resource::RLIMIT_MSGQUEUE,
            Self::Nice => Resource::RLIMIT_NICE,
            Self::Nofile => Resource::RLIMIT_NOFILE,
            Self::Nproc => Resource::RLIMIT_NPROC,
            Self::Rss => Resource::RLIMIT_RSS,
            Self::Rtprio => Resource::RLIMIT_RTPRIO,
            Self::Rttime => Resource::RLIMIT_RTTIME,
            Self::Sigpending => Resource::RLIMIT_SIGPENDING,
            Self::Stack => Resource::RLIMIT_STACK,
        }
    }
}

/// A normalized rlimit rule ready to be applied with setrlimit.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RlimitRule {
    pub kind: RlimitKind,
    pub hard: u64,
    pub soft: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(json: serde_json::Value) -> RunjConfig {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_parse_full_config() {
        let config = minimal_config(serde_json::json!({
            "overlayfs": {
                "lower_dir": "/images/busybox/rootfs",
                "upper_dir": "/tmp/runj/upperdir",
                "work_dir": "/tmp/runj/workdir",
                "merged_dir": "/tmp/runj/merged",
            },
            "cwd": "/",
            "command": ["/bin/sh", "-c", "echo hi"],
            "fd": { "stdout": "/tmp/runj/stdout.txt" },
            "mounts": [
                { "from": "/tmp/data", "to": "/data", "options": ["rw"] }
            ],
            "user_namespace": {
                "enabled": true,
                "root_uid": 1000,
                "uid_map_begin": 100000,
                "uid_map_count": 65536,
                "root_gid": 1000,
                "gid_map_begin": 100000,
                "gid_map_count": 65536,
            },
            "limits": {
                "time_ms": 3000,
                "cgroup": { "memory": 134217728, "pids_limit": 16 },
                "rlimit": {
                    "fsize": { "hard": 1048576, "soft": 1048576 },
                    "core": { "hard": 0, "soft": 0 },
                    "no_file": { "hard": 64, "soft": 64 },
                    "cpu": { "hard": 2, "soft": 1 },
                },
            },
        }));

        config.validate().unwrap();
        assert!(config.user_namespace_enabled());
        assert!(matches!(config.user_namespace, Some(UserNamespaceConfig::MapToRange { .. })));
        assert_eq!(config.limits.wall_budget_ms(), 3000);

        let rules = config.limits.rlimit.resolve().unwrap();
        assert_eq!(rules.len(), 4);
        assert!(rules.iter().any(|rule| rule.kind == RlimitKind::Cpu && rule.soft == 1));
    }

    #[test]
    fn test_parse_by_name_user_namespace() {
        let config = minimal_config(serde_json::json!({
            "rootfs": "/images/busybox/rootfs",
            "cwd": "/",
            "command": ["/bin/true"],
            "user_namespace": { "enabled": true, "map_to_user": "runj" },
        }));

        config.validate().unwrap();
        match config.user_namespace {
            Some(UserNamespaceConfig::MapToName { map_to_user: Some(user), .. }) => {
                assert_eq!(user, "runj")
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let config = minimal_config(serde_json::json!({
            "rootfs": "/rootfs",
            "cwd": "/",
            "command": ["/bin/true", ""],
        }));
        assert!(matches!(config.validate(), Err(ConfigError::EmptyCommand)));
    }

    #[test]
    fn test_validate_requires_exactly_one_root() {
        let config = minimal_config(serde_json::json!({
            "cwd": "/",
            "command": ["/bin/true"],
        }));
        assert!(matches!(config.validate(), Err(ConfigError::AmbiguousRoot)));

        let config = minimal_config(serde_json::json!({
            "rootfs": "/rootfs",
            "overlayfs": {
                "lower_dir": "/l", "upper_dir": "/u", "work_dir": "/w", "merged_dir": "/m",
            },
            "cwd": "/",
            "command": ["/bin/true"],
        }));
        assert!(matches!(config.validate(), Err(ConfigError::AmbiguousRoot)));
    }

    #[test]
    fn test_validate_rejects_unknown_rlimit() {
        let config = minimal_config(serde_json::json!({
            "rootfs": "/rootfs",
            "cwd": "/",
            "command": ["/bin/true"],
            "limits": { "rlimit": { "bogus": { "hard": 1, "soft": 1 } } },
        }));
        assert!(matches!(config.validate(), Err(ConfigError::UnknownRlimit(name)) if name == "bogus"));
    }

    #[test]
    fn test_rlimit_names() {
        assert_eq!(RlimitKind::from_name("no_file"), Some(RlimitKind::Nofile));
        assert_eq!(RlimitKind::from_name("RLIMIT_NOFILE"), Some(RlimitKind::Nofile));
        assert_eq!(RlimitKind::from_name("cpu"), Some(RlimitKind::Cpu));
        assert_eq!(RlimitKind::from_name("sigpending"), Some(RlimitKind::Sigpending));
        assert_eq!(RlimitKind::from_name("bogus"), None);
    }

    #[test]
    fn test_wall_budget_fallbacks() {
        let limits: LimitsConfig = serde_json::from_value(serde_json::json!({
            "time": { "kernel": 1000, "user": 2000 },
        }))
        .unwrap();
        assert_eq!(limits.wall_budget_ms(), 3000);
        assert_eq!(limits.kernel_limit_ms(), 1000);
        assert_eq!(limits.user_limit_ms(), 2000);

        let limits: LimitsConfig =
            serde_json::from_value(serde_json::json!({ "time": { "wall": 500 } })).unwrap();
        assert_eq!(limits.wall_budget_ms(), 500);

        let limits: LimitsConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(limits.wall_budget_ms(), 0);
    }
}
