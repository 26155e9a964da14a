//! Periodic enforcement loop
//!
//! Drives [`EnforcementEngine::run_pass`] on a fixed interval for as long as
//! the daemon is up. Passes run on the blocking pool since the store is
//! synchronous. With `skip_overlapping` set, a tick that fires while the
//! previous pass is still running is skipped instead of stacking up.

use curfew_api::{LoopState, PassReport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::{CoreEvent, EnforcementEngine};

const EVENT_CAPACITY: usize = 64;

/// Start/stop handle for the background enforcement driver
pub struct EnforcementLoop {
    shared: Arc<Shared>,
    period: Duration,
    runner: Mutex<Option<Runner>>,
}

struct Runner {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Shared {
    engine: Arc<EnforcementEngine>,
    busy: AtomicBool,
    skip_overlapping: bool,
    events: broadcast::Sender<CoreEvent>,
    last_report: Mutex<Option<PassReport>>,
}

/// Held while a pass runs; releases the busy flag on drop
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EnforcementLoop {
    pub fn new(engine: Arc<EnforcementEngine>, period: Duration, skip_overlapping: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                engine,
                busy: AtomicBool::new(false),
                skip_overlapping,
                events,
                last_report: Mutex::new(None),
            }),
            period,
            runner: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn state(&self) -> LoopState {
        if lock(&self.runner).is_some() {
            LoopState::Running
        } else {
            LoopState::Stopped
        }
    }

    /// Subscribe to lock changes and pass summaries
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.shared.events.subscribe()
    }

    /// Report of the most recent completed pass
    pub fn last_report(&self) -> Option<PassReport> {
        lock(&self.shared.last_report).clone()
    }

    /// Run one pass on the calling thread.
    ///
    /// Returns `None` when the pass was skipped by the overlap guard or
    /// could not list users.
    pub fn tick(&self) -> Option<PassReport> {
        self.shared.tick()
    }

    /// Spawn the background driver. Must be called inside a tokio runtime.
    /// Returns false if it is already running.
    pub fn start(&self) -> bool {
        let mut runner = lock(&self.runner);
        if runner.is_some() {
            debug!("Enforcement loop already running");
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(drive(self.shared.clone(), self.period, shutdown_rx));
        *runner = Some(Runner { shutdown, handle });
        drop(runner);

        info!(
            interval_secs = self.period.as_secs(),
            skip_overlapping = self.shared.skip_overlapping,
            "Enforcement loop started"
        );
        let _ = self
            .shared
            .events
            .send(CoreEvent::LoopStateChanged(LoopState::Running));
        true
    }

    /// Cancel the timer and wait for any in-flight pass to finish.
    /// Returns false if the loop was not running.
    pub async fn stop(&self) -> bool {
        let Some(runner) = lock(&self.runner).take() else {
            return false;
        };

        let _ = runner.shutdown.send(true);
        if let Err(e) = runner.handle.await {
            error!(error = %e, "Enforcement loop task failed");
        }

        info!("Enforcement loop stopped");
        let _ = self
            .shared
            .events
            .send(CoreEvent::LoopStateChanged(LoopState::Stopped));
        true
    }
}

impl Shared {
    fn tick(&self) -> Option<PassReport> {
        let _guard = if self.skip_overlapping {
            match BusyGuard::acquire(&self.busy) {
                Some(guard) => Some(guard),
                None => {
                    warn!("Previous enforcement pass still running, skipping tick");
                    return None;
                }
            }
        } else {
            None
        };

        match self.engine.run_pass() {
            Ok(outcome) => {
                for change in outcome.changes {
                    let _ = self.events.send(CoreEvent::DeviceLockChanged(change));
                }
                *lock(&self.last_report) = Some(outcome.report.clone());
                let _ = self
                    .events
                    .send(CoreEvent::PassCompleted(outcome.report.clone()));
                Some(outcome.report)
            }
            Err(e) => {
                error!(error = %e, "Enforcement pass failed");
                None
            }
        }
    }
}

async fn drive(shared: Arc<Shared>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut passes = JoinSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let shared = shared.clone();
                passes.spawn_blocking(move || {
                    shared.tick();
                });
            }
            Some(result) = passes.join_next(), if !passes.is_empty() => {
                if let Err(e) = result {
                    error!(error = %e, "Enforcement pass panicked");
                }
            }
            _ = shutdown.changed() => {
                debug!("Enforcement loop received shutdown");
                break;
            }
        }
    }

    while let Some(result) = passes.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Enforcement pass panicked");
        }
    }
}
