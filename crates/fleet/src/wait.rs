//! Small shared "wait on a condition with a deadline" helper. Used by both
//! the Readiness Monitor and the Recoverer to wait for a Record's mode to
//! change without busy-polling harder than necessary.

use crate::record::Record;
use shared::Mode;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Waits until `predicate(record.mode())` holds, or `deadline` elapses.
/// Wakes early on every `set_mode` call via the Record's `Notify`, falling
/// back to a coarse poll so a missed notification can't wedge the wait.
pub async fn wait_for_mode(record: &Record, deadline: Duration, predicate: impl Fn(Mode) -> bool) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if predicate(record.mode()) {
            return true;
        }
        if start.elapsed() >= deadline {
            return false;
        }
        tokio::select! {
            _ = record.mode_changed.notified() => {}
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}
