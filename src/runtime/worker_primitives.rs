use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const STOP_POLL_STEP: Duration = Duration::from_millis(200);

/// Lifecycle notifications a host loop sends to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoopEvent {
    Started { loop_id: &'static str, at: i64 },
    Error { loop_id: &'static str, at: i64, message: String },
    Stopped { loop_id: &'static str, at: i64 },
}

/// Sleeps for `total` in short steps. Returns `false` as soon as `stop` is
/// raised.
pub(crate) fn sleep_with_stop(stop: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::from_millis(0) {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(STOP_POLL_STEP);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !stop.load(Ordering::Relaxed)
}
