//! Periodic background maintenance.
//!
//! Each sweeper ticks on a fixed interval. A tick that arrives while the
//! previous run is still in progress is skipped rather than queued. Aborting
//! the sweeper task also aborts the run it started.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Admits at most one concurrent run of a sweep.
#[derive(Debug, Default)]
pub struct SweepGuard {
    running: AtomicBool,
}

/// Held for the duration of one sweep run.
#[derive(Debug)]
pub struct SweepPermit {
    guard: Arc<SweepGuard>,
}

impl SweepGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns a permit, or `None` while another run holds one.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SweepPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepPermit {
                guard: Arc::clone(self),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for SweepPermit {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

/// Aborts the wrapped run when dropped.
#[derive(Debug)]
struct RunningSweep(JoinHandle<()>);

impl Drop for RunningSweep {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawns a task that runs `tick` every `period`, skipping overlapping runs.
pub fn spawn_periodic_sweep<F, Fut>(
    name: &'static str,
    period: Duration,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let guard = SweepGuard::new();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;
        let mut _in_progress: Option<RunningSweep> = None;
        loop {
            interval.tick().await;
            let Some(permit) = guard.try_acquire() else {
                tracing::debug!(sweep = name, "previous sweep still running; tick skipped");
                continue;
            };
            let run = tick();
            _in_progress = Some(RunningSweep(tokio::spawn(async move {
                run.await;
                drop(permit);
            })));
        }
    })
}

/// Owns the spawned sweeper tasks and aborts them on drop.
#[derive(Debug, Default)]
pub struct SweeperHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn shutdown(mut self) {
        self.abort_all();
    }

    fn abort_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.abort_all();
    }
}
