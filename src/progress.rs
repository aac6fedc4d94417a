//! Progress UI (bar) for download runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chapterdl_core::{Coordinator, JobState, QueueSnapshot};
use indicatif::{ProgressBar, ProgressStyle};

/// Decides whether an interactive progress bar should be drawn.
#[must_use]
pub(crate) fn should_use_progress(
    stderr_is_terminal: bool,
    quiet: bool,
    dumb_terminal: bool,
) -> bool {
    stderr_is_terminal && !quiet && !dumb_terminal
}

/// Returns true when `TERM=dumb`.
#[must_use]
pub(crate) fn is_dumb_terminal() -> bool {
    std::env::var("TERM").is_ok_and(|term| term == "dumb")
}

/// Spawns the progress UI when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `enabled` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    coordinator: Arc<Coordinator>,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !enabled {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_bar(coordinator, Arc::clone(&stop));
    (Some(handle), stop)
}

fn spawn_bar(
    coordinator: Arc<Coordinator>,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} pages {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));

        while !stop.load(Ordering::SeqCst) {
            let snapshot = coordinator.snapshot();
            let (completed, total) = page_totals(&snapshot);
            bar.set_length(u64::try_from(total).unwrap_or(u64::MAX));
            bar.set_position(u64::try_from(completed).unwrap_or(u64::MAX));
            bar.set_message(status_line(&snapshot, coordinator.is_paused()));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }

        bar.finish_and_clear();
    })
}

/// Sum of page progress over every job.
pub(crate) fn page_totals(snapshot: &QueueSnapshot) -> (usize, usize) {
    snapshot
        .jobs
        .iter()
        .fold((0, 0), |(completed, total), record| {
            (
                completed + record.progress.completed,
                total + record.progress.total,
            )
        })
}

/// Short status text: chapter counts and the first running chapter.
pub(crate) fn status_line(snapshot: &QueueSnapshot, paused: bool) -> String {
    let stats = &snapshot.stats;
    let done = stats.completed + stats.failed + stats.cancelled;
    let current = snapshot
        .jobs
        .iter()
        .find(|record| record.state == JobState::Running)
        .map(|record| record.display_name().to_string());

    let mut line = format!("chapters {done}/{}", stats.total);
    if paused {
        line.push_str(" (paused)");
    } else if let Some(name) = current {
        line.push_str(" - ");
        line.push_str(&name);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_disabled_for_quiet_or_dumb_terminals() {
        assert!(should_use_progress(true, false, false));
        assert!(!should_use_progress(false, false, false));
        assert!(!should_use_progress(true, true, false));
        assert!(!should_use_progress(true, false, true));
    }

    #[test]
    fn test_empty_snapshot_status() {
        let queue = chapterdl_core::queue::QueueManager::new(chapterdl_core::DuplicatePolicy::Reject);
        let snapshot = queue.snapshot();
        assert_eq!(page_totals(&snapshot), (0, 0));
        assert_eq!(status_line(&snapshot, false), "chapters 0/0");
        assert_eq!(status_line(&snapshot, true), "chapters 0/0 (paused)");
    }
}
