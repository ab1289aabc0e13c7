use super::{RuntimeError, StatePaths};
use crate::shared::fs_atomic::atomic_write_file;
use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    NotRunning,
    Running { pid: u32 },
    /// A lock file whose pid is gone.
    Stale,
}

pub fn host_state(paths: &StatePaths) -> Result<HostState, RuntimeError> {
    match read_lock_pid(paths)? {
        None => Ok(HostState::NotRunning),
        Some(pid) if is_process_alive(pid) => Ok(HostState::Running { pid }),
        Some(_) => Ok(HostState::Stale),
    }
}

/// Takes the single-host lock for this state root. A stale lock left by a
/// crashed host is replaced; a live one is an error.
pub fn acquire_host_lock(paths: &StatePaths) -> Result<(), RuntimeError> {
    match host_state(paths)? {
        HostState::Running { pid } => return Err(RuntimeError::AlreadyRunning { pid }),
        HostState::Stale => {
            let _ = fs::remove_file(paths.host_lock_path());
        }
        HostState::NotRunning => {}
    }

    let path = paths.host_lock_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RuntimeError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&path)
        .and_then(|mut file| file.write_all(std::process::id().to_string().as_bytes()))
        .map_err(|source| RuntimeError::WriteLock {
            path: path.display().to_string(),
            source,
        })
}

pub fn release_host_lock(paths: &StatePaths) {
    let _ = fs::remove_file(paths.host_lock_path());
}

pub fn signal_stop(paths: &StatePaths) -> Result<(), RuntimeError> {
    let path = paths.stop_signal_path();
    atomic_write_file(&path, b"stop").map_err(|source| RuntimeError::WriteState {
        path: path.display().to_string(),
        source,
    })
}

pub fn clear_stop_signal(paths: &StatePaths) {
    let _ = fs::remove_file(paths.stop_signal_path());
}

/// Asks a running host to stop and waits for its pid to go away.
pub fn stop_running_host(paths: &StatePaths, timeout: Duration) -> Result<u32, RuntimeError> {
    let pid = match host_state(paths)? {
        HostState::Running { pid } => pid,
        HostState::Stale => {
            release_host_lock(paths);
            clear_stop_signal(paths);
            return Err(RuntimeError::NotRunning);
        }
        HostState::NotRunning => return Err(RuntimeError::NotRunning),
    };

    signal_stop(paths)?;
    let start = Instant::now();
    while is_process_alive(pid) && start.elapsed() < timeout {
        thread::sleep(Duration::from_millis(100));
    }
    if is_process_alive(pid) {
        return Err(RuntimeError::StopTimedOut { pid });
    }
    Ok(pid)
}

fn read_lock_pid(paths: &StatePaths) -> Result<Option<u32>, RuntimeError> {
    let path = paths.host_lock_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(RuntimeError::ReadState {
                path: path.display().to_string(),
                source,
            })
        }
    };
    // An unparsable lock counts as stale rather than absent.
    Ok(Some(raw.trim().parse::<u32>().unwrap_or(0)))
}

pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_fails_while_owner_lives() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        acquire_host_lock(&paths).expect("first lock");
        assert_eq!(
            host_state(&paths).expect("state"),
            HostState::Running {
                pid: std::process::id()
            }
        );

        let err = acquire_host_lock(&paths).expect_err("already running");
        assert!(matches!(err, RuntimeError::AlreadyRunning { .. }));

        release_host_lock(&paths);
        assert_eq!(host_state(&paths).expect("state"), HostState::NotRunning);
    }

    #[test]
    fn stale_lock_is_replaced() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        fs::create_dir_all(paths.daemon_dir()).expect("daemon dir");
        fs::write(paths.host_lock_path(), "999999999").expect("stale lock");

        assert_eq!(host_state(&paths).expect("state"), HostState::Stale);
        acquire_host_lock(&paths).expect("replace stale lock");
        let raw = fs::read_to_string(paths.host_lock_path()).expect("read lock");
        assert_eq!(raw, std::process::id().to_string());
    }

    #[test]
    fn stop_without_host_reports_not_running() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        let err = stop_running_host(&paths, Duration::from_millis(10)).expect_err("not running");
        assert!(matches!(err, RuntimeError::NotRunning));
    }
}
