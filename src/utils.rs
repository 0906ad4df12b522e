use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};

use nanoid::nanoid;
use nix::sys::stat::{umask, Mode};
use once_cell::sync::Lazy;

const INSTANCE_ID_ALPHABET: [char; 52] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L',
    'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
];

/// Nonce identifying this invocation. Both the cgroup directories and the
/// systemd units derive their names from it.
pub static RUNJ_INSTANCE_ID: Lazy<String> = Lazy::new(|| nanoid!(12, &INSTANCE_ID_ALPHABET));

/// Returns true if the path exists and is a regular file.
pub fn file_exists(path: impl AsRef<Path>) -> bool {
    fs::metadata(path).map(|info| info.is_file()).unwrap_or(false)
}

/// Returns true if the path exists and is a directory.
pub fn directory_exists(path: impl AsRef<Path>) -> bool {
    fs::metadata(path).map(|info| info.is_dir()).unwrap_or(false)
}

/// Checks that the mode of `path` contains all of the permission `bits`.
pub fn check_permission(path: impl AsRef<Path>, bits: u32) -> io::Result<()> {
    let mode = fs::metadata(path.as_ref())?.mode();
    if mode & bits != bits {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!(
                "insufficient permissions on {}: have {:o}, want at least {:o}",
                path.as_ref().display(),
                mode & 0o777,
                bits
            ),
        ));
    }

    Ok(())
}

pub fn directory_empty(path: impl AsRef<Path>) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Opens an output file for the container's stdout or stderr. Existing files
/// are truncated, missing ones created exclusively. The umask is cleared for
/// the duration of the open so the file ends up with mode 0664 regardless of
/// the caller's environment.
pub fn prepare_out_file(path: impl AsRef<Path>) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).truncate(true).mode(0o664);
    if !path.as_ref().exists() {
        options.create_new(true);
    }

    let mask = umask(Mode::empty());
    let file = options.open(path.as_ref());
    umask(mask);

    file
}

/// Resolves `path` against the current directory and removes `.` and `..`
/// components without touching the filesystem.
pub fn to_absolute(path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let path = path.as_ref();
    let absolute = if path.is_relative() { std::env::current_dir()?.join(path) } else { path.to_path_buf() };
    Ok(normalize(&absolute))
}

fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => result.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            Component::Normal(part) => result.push(part),
            Component::Prefix(..) => unreachable!(),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_instance_id_shape() {
        assert_eq!(RUNJ_INSTANCE_ID.len(), 12);
        assert!(RUNJ_INSTANCE_ID.chars().all(|c| c.is_ascii_alphabetic()));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize(Path::new("/../a")), PathBuf::from("/a"));
    }

    #[test]
    fn test_prepare_out_file_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout.txt");

        let mut file = prepare_out_file(&path).unwrap();
        file.write_all(b"first run").unwrap();
        drop(file);

        let file = prepare_out_file(&path).unwrap();
        drop(file);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_directory_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(directory_empty(dir.path()).unwrap());

        fs::write(dir.path().join("file"), b"x").unwrap();
        assert!(!directory_empty(dir.path()).unwrap());
    }
}
