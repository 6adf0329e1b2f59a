//! Drives scrape cycles on a fixed interval until shutdown.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::scrape::ScrapeCycle;
use crate::sensor::SensorSource;

/// Lifecycle of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Created, not started.
    Idle,
    /// Ticking and running cycles.
    Running,
    /// Stop requested; the in-flight cycle is finishing.
    Stopping,
    /// Done. No further cycles will run.
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "idle"),
            SchedulerState::Running => write!(f, "running"),
            SchedulerState::Stopping => write!(f, "stopping"),
            SchedulerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Source of scheduling ticks.
pub trait Ticker: Send {
    /// Wait for the next tick.
    fn tick(&mut self) -> impl Future<Output = ()> + Send;
}

impl Ticker for Interval {
    async fn tick(&mut self) {
        Interval::tick(self).await;
    }
}

/// A ticker that fires immediately and then every `period`.
///
/// Ticks missed while a cycle overran are not replayed in a burst.
pub fn interval_ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Runs one [`ScrapeCycle`] per tick, never overlapping two cycles.
pub struct Scheduler<S, T> {
    cycle: ScrapeCycle<S>,
    ticker: T,
    state: watch::Sender<SchedulerState>,
}

impl<S: SensorSource, T: Ticker> Scheduler<S, T> {
    /// Create an idle scheduler.
    pub fn new(cycle: ScrapeCycle<S>, ticker: T) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            cycle,
            ticker,
            state,
        }
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    fn transition(&self, next: SchedulerState) {
        debug!(from = %self.state(), to = %next, "Scheduler state change");
        self.state.send_replace(next);
    }

    /// Run until `shutdown` becomes `true` or its sender is dropped.
    ///
    /// A stop requested while a cycle is in flight moves the scheduler to
    /// `Stopping` right away, but the cycle still runs to completion. No new
    /// cycle starts after that. Returns the final state.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SchedulerState {
        self.transition(SchedulerState::Running);
        info!(
            sensors = self.cycle.addresses().len(),
            "Scheduler running"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = self.ticker.tick() => {}
            }

            let cycle = self.cycle.run();
            tokio::pin!(cycle);

            let (report, stop_requested) = tokio::select! {
                biased;
                report = &mut cycle => (report, false),
                _ = wait_for_shutdown(&mut shutdown) => {
                    self.transition(SchedulerState::Stopping);
                    info!("Stop requested, finishing in-flight scrape cycle");
                    (cycle.await, true)
                }
            };

            if report.failed() > 0 {
                warn!(
                    succeeded = report.succeeded(),
                    failed = report.failed(),
                    duration_ms = report.duration.as_millis() as u64,
                    "Scrape cycle finished with failures"
                );
            }

            if stop_requested {
                break;
            }
        }

        if self.state() != SchedulerState::Stopping {
            self.transition(SchedulerState::Stopping);
        }
        info!("Scheduler stopping");
        self.transition(SchedulerState::Stopped);
        SchedulerState::Stopped
    }
}

/// Resolve once the shutdown flag is set or the sender goes away.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
