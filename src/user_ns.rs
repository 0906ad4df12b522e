use std::fs::{self, File};
use std::io::{BufRead, BufReader};

use nix::unistd::{getegid, geteuid, Group, User};
use oci_spec::runtime::{LinuxIdMapping, LinuxIdMappingBuilder};

use crate::config::UserNamespaceConfig;

const SUBUID_PATH: &str = "/etc/subuid";
const SUBGID_PATH: &str = "/etc/subgid";

#[derive(Debug, thiserror::Error)]
pub enum IdMapError {
    #[error("cannot find a subordinate id entry for {name} in {path}")]
    NotFound { name: String, path: &'static str },
    #[error("unexpected line in {path}: {line}")]
    Malformed { path: &'static str, line: String },
    #[error("cannot resolve user or group {0}")]
    UnknownName(String),
    #[error("error reading {path}")]
    Io {
        path: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Oci(#[from] oci_spec::OciSpecError),
}

type Result<T> = std::result::Result<T, IdMapError>;

/// Id mappings normalized from either config shape. Each class carries the
/// mandatory container-0 row plus the subordinate range starting at 1.
#[derive(Debug, Clone)]
pub struct ResolvedIdMaps {
    pub uid: Vec<LinuxIdMapping>,
    pub gid: Vec<LinuxIdMapping>,
}

pub fn resolve(config: &UserNamespaceConfig) -> Result<ResolvedIdMaps> {
    match config {
        UserNamespaceConfig::MapToRange {
            root_uid,
            uid_map_begin,
            uid_map_count,
            root_gid,
            gid_map_begin,
            gid_map_count,
            ..
        } => Ok(ResolvedIdMaps {
            uid: assemble(*root_uid, *uid_map_begin, *uid_map_count)?,
            gid: assemble(*root_gid, *gid_map_begin, *gid_map_count)?,
        }),
        UserNamespaceConfig::MapToName { map_to_user, map_to_group, .. } => {
            let (root_uid, user_name) = resolve_user(map_to_user.as_deref())?;
            let (uid_begin, uid_count) = find_subordinate_ids(SUBUID_PATH, &user_name)?;

            let (root_gid, group_name) = resolve_group(map_to_group.as_deref(), &user_name)?;
            let (gid_begin, gid_count) = find_subordinate_ids(SUBGID_PATH, &group_name)?;

            Ok(ResolvedIdMaps {
                uid: assemble(root_uid, uid_begin, uid_count)?,
                gid: assemble(root_gid, gid_begin, gid_count)?,
            })
        }
    }
}

fn assemble(root_id: u32, begin: u32, count: u32) -> Result<Vec<LinuxIdMapping>> {
    // The container-0 row is what lets the runtime drop root inside the
    // namespace, it must always be present.
    Ok(vec![
        LinuxIdMappingBuilder::default().container_id(0u32).host_id(root_id).size(1u32).build()?,
        LinuxIdMappingBuilder::default().container_id(1u32).host_id(begin).size(count).build()?,
    ])
}

fn resolve_user(name: Option<&str>) -> Result<(u32, String)> {
    match name {
        Some(name) => {
            let user = User::from_name(name)?
                .ok_or_else(|| IdMapError::UnknownName(name.to_string()))?;
            Ok((user.uid.as_raw(), user.name))
        }
        None => {
            // Only subordinate info is configured, map container root onto
            // the effective id.
            let uid = geteuid();
            let user =
                User::from_uid(uid)?.ok_or_else(|| IdMapError::UnknownName(uid.to_string()))?;
            Ok((uid.as_raw(), user.name))
        }
    }
}

fn resolve_group(name: Option<&str>, fallback_user: &str) -> Result<(u32, String)> {
    match name {
        Some(name) => {
            let group = Group::from_name(name)?
                .ok_or_else(|| IdMapError::UnknownName(name.to_string()))?;
            Ok((group.gid.as_raw(), group.name))
        }
        // The subgid scan falls back to the user name, which is how the
        // subordinate files are commonly keyed.
        None => Ok((getegid().as_raw(), fallback_user.to_string())),
    }
}

fn find_subordinate_ids(path: &'static str, name: &str) -> Result<(u32, u32)> {
    let file = File::open(path).map_err(|source| IdMapError::Io { path, source })?;
    let lines = BufReader::new(file).lines().map_while(|line| line.ok());
    find_subordinate_ids_in(lines, path, name)
}

fn find_subordinate_ids_in(
    lines: impl Iterator<Item = String>,
    path: &'static str,
    name: &str,
) -> Result<(u32, u32)> {
    for line in lines {
        match line.split(':').collect::<Vec<_>>()[..] {
            [entry, _, _] if entry != name => continue,
            [_, begin, count] => {
                let begin = begin
                    .parse()
                    .map_err(|_| IdMapError::Malformed { path, line: line.clone() })?;
                let count = count
                    .parse()
                    .map_err(|_| IdMapError::Malformed { path, line: line.clone() })?;
                return Ok((begin, count));
            }
            _ => return Err(IdMapError::Malformed { path, line: line.clone() }),
        }
    }

    Err(IdMapError::NotFound { name: name.to_string(), path })
}

/// Whether the current process already lives in a user namespace, detected
/// from the identity mapping the kernel presents for the initial namespace.
pub fn running_in_user_ns() -> bool {
    match fs::read_to_string("/proc/self/uid_map") {
        Ok(content) => {
            let fields: Vec<_> = content.split_whitespace().collect();
            fields != ["0", "0", "4294967295"]
        }
        Err(_) => false,
    }
}

/// Writes the resolved mappings for a child process using the setuid
/// helpers, which are required for ranges beyond a single id.
pub fn write_mappings(pid: nix::unistd::Pid, maps: &ResolvedIdMaps) -> std::io::Result<()> {
    run_map_helper("/usr/bin/newuidmap", pid, &maps.uid)?;
    run_map_helper("/usr/bin/newgidmap", pid, &maps.gid)?;
    Ok(())
}

fn run_map_helper(
    helper: &str,
    pid: nix::unistd::Pid,
    mappings: &[LinuxIdMapping],
) -> std::io::Result<()> {
    let mut command = std::process::Command::new(helper);
    command.arg(pid.as_raw().to_string());
    for mapping in mappings {
        command
            .arg(mapping.container_id().to_string())
            .arg(mapping.host_id().to_string())
            .arg(mapping.size().to_string());
    }

    let output = command.output()?;
    if !output.status.success() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!(
                "{helper} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserNamespaceConfig;

    fn lines(content: &str) -> impl Iterator<Item = String> + '_ {
        content.split('\n').map(|line| line.to_string())
    }

    #[test]
    fn test_find_subordinate_ids() {
        let content = "alice:100000:65536\nbob:165536:65536\nalice:231072:1000";
        assert_eq!(
            find_subordinate_ids_in(lines(content), "/etc/subuid", "alice").unwrap(),
            (100000, 65536)
        );
        assert_eq!(
            find_subordinate_ids_in(lines(content), "/etc/subuid", "bob").unwrap(),
            (165536, 65536)
        );
    }

    #[test]
    fn test_find_subordinate_ids_missing() {
        let content = "alice:100000:65536";
        assert!(matches!(
            find_subordinate_ids_in(lines(content), "/etc/subuid", "carol"),
            Err(IdMapError::NotFound { name, .. }) if name == "carol"
        ));
    }

    #[test]
    fn test_find_subordinate_ids_malformed() {
        assert!(matches!(
            find_subordinate_ids_in(lines("alice:"), "/etc/subuid", "alice"),
            Err(IdMapError::Malformed { .. })
        ));
        assert!(matches!(
            find_subordinate_ids_in(lines("alice:oops:65536"), "/etc/subuid", "alice"),
            Err(IdMapError::Malformed { .. })
        ));
    }

    #[test]
    fn test_resolve_explicit_range() {
        let config = UserNamespaceConfig::MapToRange {
            enabled: true,
            root_uid: 1000,
            uid_map_begin: 100000,
            uid_map_count: 65536,
            root_gid: 1000,
            gid_map_begin: 200000,
            gid_map_count: 65536,
        };

        let maps = resolve(&config).unwrap();

        // The container-0 row must be the first entry of both classes.
        assert_eq!(maps.uid[0].container_id(), 0);
        assert_eq!(maps.uid[0].host_id(), 1000);
        assert_eq!(maps.uid[0].size(), 1);
        assert_eq!(maps.uid[1].container_id(), 1);
        assert_eq!(maps.uid[1].host_id(), 100000);
        assert_eq!(maps.gid[1].host_id(), 200000);
    }
}
