//! Process Probe (PP): turns a PID into a [`ProcessFingerprint`], or fails.
//!
//! Grounded on `/proc`, the same facility `examples/original_source/os.cpp`
//! (`runfs_os_get_proc_path`, `runfs_os_is_proc_running`) uses on Linux. No
//! caches, no retries: every call to [`probe`] takes a fresh snapshot.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::error::ProbeError;

const DELETED_SUFFIX: &str = " (deleted)";

/// Immutable snapshot of a process's identity, produced by [`probe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFingerprint {
    pub pid: i32,
    pub live: bool,
    pub exe_path: Vec<u8>,
    pub exe_ino: u64,
    pub exe_size: u64,
    /// (seconds, nanoseconds)
    pub exe_mtime: (i64, i64),
    pub start_time: u64,
    pub binary_deleted: bool,
}

/// Take a fresh snapshot of `pid`.
///
/// Fails with [`ProbeError::NotFound`] if the process does not exist,
/// [`ProbeError::Denied`] if required metadata can't be read, and
/// [`ProbeError::Io`] for any other transient I/O error.
pub fn probe(pid: i32) -> Result<ProcessFingerprint, ProbeError> {
    let proc_dir = format!("/proc/{pid}");
    if !Path::new(&proc_dir).exists() {
        return Err(ProbeError::NotFound);
    }

    let exe_link = format!("{proc_dir}/exe");

    // One hop: readlink recovers the textual path (and lets us notice the
    // " (deleted)" marker); opening the magic symlink directly resolves it
    // to the real executable without us having to chase anything further.
    let target = fs::read_link(&exe_link).map_err(classify_io)?;
    let target_bytes = target.as_os_str().as_encoded_bytes().to_vec();
    let binary_deleted = target
        .to_str()
        .map(|s| s.ends_with(DELETED_SUFFIX))
        .unwrap_or(false);

    let exe_meta = fs::File::open(&exe_link)
        .and_then(|f| f.metadata())
        .map_err(classify_io)?;

    if !exe_meta.is_file() {
        return Err(ProbeError::Denied);
    }

    let start_time = read_start_time(pid)?;

    Ok(ProcessFingerprint {
        pid,
        live: true,
        exe_path: target_bytes,
        exe_ino: exe_meta.ino(),
        exe_size: exe_meta.size(),
        exe_mtime: (exe_meta.mtime(), exe_meta.mtime_nsec()),
        start_time,
        binary_deleted,
    })
}

fn classify_io(e: std::io::Error) -> ProbeError {
    match e.kind() {
        std::io::ErrorKind::NotFound => ProbeError::NotFound,
        std::io::ErrorKind::PermissionDenied => ProbeError::Denied,
        _ => ProbeError::Io(e),
    }
}

/// Field 22 of `/proc/<pid>/stat`: process start time in clock ticks since
/// boot. The command-name field (2nd, parenthesized) may itself contain
/// spaces and parentheses, so we split on the *last* `)` rather than
/// whitespace-tokenizing the whole line.
fn read_start_time(pid: i32) -> Result<u64, ProbeError> {
    let raw = fs::read_to_string(format!("/proc/{pid}/stat")).map_err(classify_io)?;
    let after_comm = raw.rsplit_once(')').ok_or(ProbeError::Io(
        std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed /proc/pid/stat"),
    ))?.1;

    // fields after comm, space-separated, 1-indexed from state (field 3):
    // state(3) ppid(4) ... starttime(22) -> index 22-3 = 19 in this slice (0-based)
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    const STARTTIME_INDEX: usize = 22 - 3;
    fields
        .get(STARTTIME_INDEX)
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(ProbeError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "missing starttime field",
        )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Child, Command};

    fn spawn_sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep")
    }

    #[test]
    fn probe_running_process_succeeds() {
        let mut child = spawn_sleeper();
        let pid = child.id() as i32;

        let fp = probe(pid).expect("probe should succeed for a live process");
        assert_eq!(fp.pid, pid);
        assert!(fp.live);
        assert!(!fp.binary_deleted);
        assert!(fp.start_time > 0);

        child.kill().ok();
        child.wait().ok();
    }

    #[test]
    fn probe_dead_process_not_found() {
        let mut child = spawn_sleeper();
        let pid = child.id() as i32;
        child.kill().expect("kill");
        child.wait().expect("wait");

        // give the kernel a moment to tear down /proc/<pid>
        std::thread::sleep(std::time::Duration::from_millis(50));

        match probe(pid) {
            Err(ProbeError::NotFound) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn fingerprints_of_same_process_are_stable() {
        let mut child = spawn_sleeper();
        let pid = child.id() as i32;

        let a = probe(pid).unwrap();
        let b = probe(pid).unwrap();
        assert_eq!(a, b);

        child.kill().ok();
        child.wait().ok();
    }
}
