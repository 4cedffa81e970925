//! Timer controller
//!
//! One background thread, started lazily by the first timed insertion and
//! stopped at shutdown. It pops due entries from the hot and cold timed heaps
//! in due order and fires them: scheduled tasks become ready exactly as
//! `start` would make them, parked sleepers are woken, and tasks whose timeout
//! passed are cancelled.

use super::shared::{GlobState, Shared, TimedEntry, TimedKind};
use crate::error::{CancelReason, RtResult, TaskError};
use parking_lot::MutexGuard;
use std::collections::BinaryHeap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Start the controller thread if it is not running
pub(crate) fn ensure_started(shared: &Arc<Shared>) -> RtResult<()> {
    let mut glob = shared.glob.lock();
    if glob.timer_running || shared.is_shutdown() {
        return Ok(());
    }
    let timer_shared = shared.clone();
    let handle = thread::Builder::new()
        .name("weft-timer".to_string())
        .spawn(move || run(timer_shared))
        .map_err(|err| TaskError::from_io(&err))?;
    glob.timer_running = true;
    drop(glob);
    *shared.timer.lock() = Some(handle);
    tracing::debug!("timer controller started");
    Ok(())
}

/// Stop the controller thread and wait for it
pub(crate) fn stop(shared: &Shared) {
    {
        let _glob = shared.glob.lock();
        shared.timer_cv.notify_all();
    }
    if let Some(handle) = shared.timer.lock().take() {
        let _ = handle.join();
        tracing::debug!("timer controller stopped");
    }
}

fn run(shared: Arc<Shared>) {
    let poll = shared.config.timer_poll();
    let mut glob = shared.glob.lock();
    loop {
        if shared.is_shutdown() {
            glob.timer_running = false;
            break;
        }

        let now = Instant::now();
        let due = take_due(&shared, &mut glob, now);
        if !due.is_empty() {
            MutexGuard::unlocked(&mut glob, || {
                for entry in due {
                    fire(&shared, entry);
                }
            });
            continue;
        }

        let next = next_due(&shared, &glob);
        let wait = next
            .map(|due| due.saturating_duration_since(now))
            .unwrap_or(poll)
            .min(poll);
        shared.timer_cv.wait_for(&mut glob, wait);
    }
}

/// Pop every entry due at `now` from both heaps, merged in due order
fn take_due(shared: &Shared, glob: &mut GlobState, now: Instant) -> Vec<TimedEntry> {
    let mut due = Vec::new();
    pop_due(&mut glob.timed_hot, now, &mut due);
    shared
        .timed_hot_len
        .store(glob.timed_hot.len(), Ordering::Relaxed);

    let mut cold = shared.timed_cold.lock();
    pop_due(&mut cold, now, &mut due);
    shared.timed_cold_len.store(cold.len(), Ordering::Relaxed);

    due.sort_by(|a, b| a.due.cmp(&b.due).then_with(|| a.order.cmp(&b.order)));
    due
}

fn pop_due(heap: &mut BinaryHeap<TimedEntry>, now: Instant, out: &mut Vec<TimedEntry>) {
    while heap.peek().is_some_and(|entry| entry.due <= now) {
        if let Some(entry) = heap.pop() {
            out.push(entry);
        }
    }
}

fn next_due(shared: &Shared, glob: &GlobState) -> Option<Instant> {
    let hot = glob.timed_hot.peek().map(|entry| entry.due);
    let cold = shared.timed_cold.lock().peek().map(|entry| entry.due);
    match (hot, cold) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn fire(shared: &Shared, entry: TimedEntry) {
    match entry.kind {
        TimedKind::Start(task) => shared.make_ready(&task),
        TimedKind::Wake(task, seq) => {
            shared.wake(&task, seq);
        }
        TimedKind::Deadline(task) => {
            if !task.is_finished() {
                tracing::trace!(task = %task.id(), "task timed out");
                shared.cancel(&task, CancelReason::Timeout);
            }
        }
    }
}

/// Remove every pending entry (shutdown)
pub(crate) fn drain(shared: &Shared) -> Vec<TimedEntry> {
    let mut entries: Vec<TimedEntry> = {
        let mut glob = shared.glob.lock();
        let hot = std::mem::take(&mut glob.timed_hot);
        shared.timed_hot_len.store(0, Ordering::Relaxed);
        hot.into_vec()
    };
    let cold = std::mem::take(&mut *shared.timed_cold.lock());
    shared.timed_cold_len.store(0, Ordering::Relaxed);
    entries.extend(cold.into_vec());
    entries
}
