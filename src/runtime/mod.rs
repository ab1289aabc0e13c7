//! The long-running host: state layout, single-host lock, the loops that
//! drive scheduler, mailbox and inbox, and the agent turn they share.

pub mod context;
pub mod host_lock;
pub mod loops;
pub mod state_paths;
pub mod supervisor;
pub mod turn;
pub(crate) mod worker_primitives;

pub use crate::shared::errors::RuntimeError;
pub use context::HostContext;
pub use host_lock::{
    acquire_host_lock, host_state, is_process_alive, release_host_lock, signal_stop,
    stop_running_host, HostState,
};
pub use loops::{drain_inbox_once, drain_mailboxes, tick_scheduler, InboxReport};
pub use state_paths::{bootstrap_state_root, StatePaths};
pub use supervisor::{run_host, run_host_with_gateway, shutdown_wait_timeout};
pub use turn::{run_agent_turn, ScheduledTurns, TurnKind, TurnReport};

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bootstrap_creates_required_directories() {
        let dir = tempdir().expect("temp dir");
        let paths = StatePaths::new(dir.path().join("state"));
        bootstrap_state_root(&paths).expect("bootstrap succeeds");

        for required in paths.required_directories() {
            assert!(
                required.is_dir(),
                "missing directory: {}",
                required.display()
            );
        }
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let dir = tempdir().expect("temp dir");
        let paths = StatePaths::new(dir.path());
        bootstrap_state_root(&paths).expect("first");
        std::fs::write(paths.global_dir().join("CLAUDE.md"), "shared").expect("write");
        bootstrap_state_root(&paths).expect("second");
        assert!(paths.global_dir().join("CLAUDE.md").is_file());
    }
}
