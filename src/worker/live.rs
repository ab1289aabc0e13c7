//! Pids of workers currently running, shared by every clone of a runner so
//! the host can take them down on shutdown.

use std::collections::BTreeSet;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct LiveState {
    pids: BTreeSet<u32>,
    closed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LiveWorkers {
    state: Arc<Mutex<LiveState>>,
}

impl LiveWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LiveState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records a freshly spawned worker. Returns false once the set has been
    /// closed; the caller then owns killing the process.
    pub fn register(&self, pid: u32) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.pids.insert(pid);
        true
    }

    pub fn unregister(&self, pid: u32) {
        self.lock().pids.remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.lock().pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Closes the set against new workers and kills the process group of
    /// every worker still registered. Returns how many were signalled.
    pub fn terminate_all(&self) -> usize {
        let pids: Vec<u32> = {
            let mut state = self.lock();
            state.closed = true;
            state.pids.iter().copied().collect()
        };
        for pid in &pids {
            kill_process_group(*pid);
        }
        pids.len()
    }
}

/// Workers lead their own process group, so the group id is the worker pid.
pub fn kill_process_group(pid: u32) {
    if pid == 0 {
        return;
    }
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{pid}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

/// Drops the pid from the live set when the invocation ends, on every path.
pub(crate) struct LiveGuard<'a> {
    live: &'a LiveWorkers,
    pid: u32,
}

impl<'a> LiveGuard<'a> {
    pub(crate) fn new(live: &'a LiveWorkers, pid: u32) -> Self {
        Self { live, pid }
    }
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.live.unregister(self.pid);
    }
}
