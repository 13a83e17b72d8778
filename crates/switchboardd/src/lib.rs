//! Shared helpers used by the `switchboardd` daemon binary.

use std::fs;
use std::path::Path;

/// Build-time daemon version string.
pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// PID file management
// ---------------------------------------------------------------------------

/// Reads the daemon PID from `path`, returning `None` if missing or invalid.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Writes the current process PID to `path`.
pub fn write_pid_file(path: &Path) -> anyhow::Result<()> {
    fs::write(path, std::process::id().to_string())?;
    Ok(())
}

/// Removes the PID file at `path` if it exists.
pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Returns `true` when a process with `pid` appears to be alive.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Whether `pid` looks like a switchboardd process, guarding against PID
/// reuse when honoring a stale PID file.
pub fn pid_looks_like_daemon(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let output = std::process::Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .arg("-o")
            .arg("comm=")
            .output();

        match output {
            Ok(out) if out.status.success() => {
                let comm = String::from_utf8_lossy(&out.stdout)
                    .trim()
                    .to_ascii_lowercase();
                comm.ends_with("switchboardd")
            }
            _ => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_pid_file_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");
        fs::write(&path, "12345").unwrap();
        assert_eq!(read_pid_file(&path), Some(12345));
    }

    #[test]
    fn read_pid_file_with_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");
        fs::write(&path, "  42  \n").unwrap();
        assert_eq!(read_pid_file(&path), Some(42));
    }

    #[test]
    fn read_pid_file_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_pid_file(&dir.path().join("nope.pid")), None);
    }

    #[test]
    fn read_pid_file_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.pid");
        fs::write(&path, "not-a-number").unwrap();
        assert_eq!(read_pid_file(&path), None);
    }

    #[test]
    fn read_pid_file_negative() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("neg.pid");
        fs::write(&path, "-1").unwrap();
        assert_eq!(read_pid_file(&path), None);
    }

    #[test]
    fn write_pid_file_records_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");
        write_pid_file(&path).unwrap();
        assert_eq!(read_pid_file(&path), Some(std::process::id()));
    }

    #[test]
    fn write_pid_file_overwrites_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");
        fs::write(&path, "99999").unwrap();
        write_pid_file(&path).unwrap();
        assert_eq!(read_pid_file(&path), Some(std::process::id()));
    }

    #[test]
    fn write_pid_file_bad_path_fails() {
        assert!(write_pid_file(Path::new("/nonexistent/dir/test.pid")).is_err());
    }

    #[test]
    fn remove_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");
        write_pid_file(&path).unwrap();
        assert!(path.exists());
        remove_pid_file(&path);
        assert!(!path.exists());
        remove_pid_file(&path); // no-op on missing file
    }

    #[test]
    fn is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn is_process_alive_nonexistent() {
        assert!(!is_process_alive(4_000_000_000));
    }

    #[test]
    fn own_process_is_not_mistaken_for_daemon() {
        // The test binary is not named switchboardd.
        assert!(!pid_looks_like_daemon(std::process::id()));
    }
}
