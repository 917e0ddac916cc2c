//! Timers whose callbacks run inside the coordination loop.
//!
//! A timer is a background tokio task that only waits. When it fires it hands a [`Job`] to
//! the [`Scheduler`], and the hub runs that job between other work items with exclusive
//! access to the lobby manager. Stopping a timer aborts its task and raises a shared flag
//! that every job it already queued re-checks before doing anything, so a stopped timer's
//! callback never runs even if it was in flight.

use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::GameResult;
use crate::lobby_manager::LobbyManager;

/// A unit of deferred coordination work.
pub type Job = Box<dyn FnOnce(&mut LobbyManager) -> GameResult + Send>;

/// Shared callback for repeating ticks.
pub type TickFn = Arc<dyn Fn(&mut LobbyManager) -> GameResult + Send + Sync>;

/// Submits jobs to the coordination loop.
#[derive(Clone)]
pub struct Scheduler {
    sender: mpsc::UnboundedSender<Job>,
}

impl Scheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Scheduler { sender }, receiver)
    }

    pub fn add(&self, job: Job) {
        if self.sender.send(job).is_err() {
            warn!("coordination loop is gone; dropping scheduled job");
        }
    }
}

fn guarded(stopped: &Arc<AtomicBool>, job: Job) -> Job {
    let stopped = Arc::clone(stopped);

    Box::new(move |mgr| {
        if stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        job(mgr)
    })
}

/// Stops a [`Timer`] from elsewhere. The timer's task keeps sleeping but its callbacks no
/// longer run.
#[derive(Debug, Clone)]
pub struct StopHandle {
    end: Instant,
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn has_ended(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) || Instant::now() >= self.end
    }
}

/// A one-shot or repeating timer.
///
/// Dropping a timer does not stop it.
pub struct Timer {
    end: Instant,
    stopped: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    /// A timer that has already ended and will never fire.
    pub fn expired() -> Self {
        Timer {
            end: Instant::now(),
            stopped: Arc::new(AtomicBool::new(true)),
            task: None,
        }
    }

    /// Runs `job` once after `delay`.
    pub fn single(scheduler: &Scheduler, delay: Duration, job: Job) -> Self {
        let end = Instant::now() + delay;
        let stopped = Arc::new(AtomicBool::new(false));

        let scheduler = scheduler.clone();
        let job = guarded(&stopped, job);

        let task = tokio::spawn(async move {
            tokio::time::sleep_until(end).await;
            scheduler.add(job);
        });

        Timer {
            end,
            stopped,
            task: Some(task),
        }
    }

    /// Runs `tick` every `interval` until `duration` has passed, then runs `on_end` once.
    ///
    /// The first tick happens one interval after creation. If a tick and the deadline fall
    /// on the same instant, only `on_end` runs.
    pub fn ticking(
        scheduler: &Scheduler,
        duration: Duration,
        interval: Duration,
        tick: TickFn,
        on_end: Job,
    ) -> Self {
        let start = Instant::now();
        let end = start + duration;
        let stopped = Arc::new(AtomicBool::new(false));

        let scheduler = scheduler.clone();
        let on_end = guarded(&stopped, on_end);
        let tick_stopped = Arc::clone(&stopped);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let deadline = tokio::time::sleep_until(end);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    biased;

                    _ = &mut deadline => {
                        scheduler.add(on_end);
                        return;
                    }
                    _ = ticker.tick() => {
                        let tick = Arc::clone(&tick);
                        scheduler.add(guarded(&tick_stopped, Box::new(move |mgr| tick(mgr))));
                    }
                }
            }
        });

        Timer {
            end,
            stopped,
            task: Some(task),
        }
    }

    /// Prevents any further callback from this timer. Idempotent, and a no-op after expiry.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);

        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            end: self.end,
            stopped: Arc::clone(&self.stopped),
        }
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// True once the timer was stopped or its deadline has passed.
    pub fn has_ended(&self) -> bool {
        self.was_stopped() || Instant::now() >= self.end
    }

    /// Zero once stopped or past the deadline.
    pub fn time_left(&self) -> Duration {
        if self.was_stopped() {
            return Duration::ZERO;
        }

        self.end.saturating_duration_since(Instant::now())
    }
}

impl Default for Timer {
    fn default() -> Self {
        Timer::expired()
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("time_left", &self.time_left())
            .field("stopped", &self.was_stopped())
            .finish()
    }
}
