//! Background sweeping of expired entries.
//!
//! Stores that hold expiring entries implement [`Sweep`]. A sweeper is a tokio
//! task owned through a [`SweeperHandle`]: it holds only a weak reference to its
//! target, exits on its own once the target is dropped, and is aborted when the
//! handle is dropped.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Stand-in for "never" when a deadline would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Shortest interval a sweeper runs at.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// `now + after`, saturating at a far-future instant instead of panicking.
pub(crate) fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE)
}

/// A store that can evict its expired entries.
pub trait Sweep: Send + Sync + 'static {
    /// Remove every expired entry, returning how many were removed.
    fn sweep_expired(&self) -> usize;
}

/// Owner of a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    name: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Name given to the sweeper at spawn time.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the sweeper task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the sweeper to stop and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!(sweeper = self.name, "Sweeper stopped");
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Spawn a task that calls [`Sweep::sweep_expired`] on `target` every `interval`.
///
/// The first sweep happens one full interval after spawning. The interval is
/// clamped to at least 1ms. Must be called from within a tokio runtime.
pub fn spawn_sweeper<S: Sweep>(
    name: &'static str,
    target: Weak<S>,
    interval: Duration,
) -> SweeperHandle {
    let (tx, mut rx) = oneshot::channel::<()>();
    let interval = interval.clamp(MIN_INTERVAL, FAR_FUTURE);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(deadline_after(Instant::now(), interval), interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut rx => break,
                _ = ticker.tick() => {
                    let Some(target) = target.upgrade() else {
                        debug!(sweeper = name, "Sweep target dropped, exiting");
                        break;
                    };
                    let removed = target.sweep_expired();
                    if removed > 0 {
                        debug!(sweeper = name, removed, "Swept expired entries");
                    } else {
                        trace!(sweeper = name, "Sweep found nothing to remove");
                    }
                }
            }
        }
    });

    info!(sweeper = name, interval_ms = interval.as_millis() as u64, "Sweeper started");

    SweeperHandle {
        name,
        shutdown: Some(tx),
        task: Some(task),
    }
}
