use crate::dispatcher::IngestDispatcher;
use crate::ledger::AttendanceLedger;
use chrono::{Days, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Earliest configured time strictly after `now`, rolling over to the first
/// time of the next day. `times` must be sorted; `None` if it is empty.
pub fn next_reset_after(now: NaiveDateTime, times: &[NaiveTime]) -> Option<NaiveDateTime> {
    let first = *times.first()?;
    if let Some(t) = times.iter().find(|t| **t > now.time()) {
        return Some(now.date().and_time(*t));
    }
    let tomorrow = now.date().checked_add_days(Days::new(1))?;
    Some(tomorrow.and_time(first))
}

/// Owns the daemon's periodic tasks and stops them together.
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Receiver that changes once shutdown begins; for tasks owned elsewhere.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Sweep stale transfer sessions every `interval`.
    pub fn spawn_reaper(&mut self, dispatcher: Arc<IngestDispatcher>, interval: Duration) {
        let mut stop = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tick.tick() => {
                        let reaped = dispatcher.reap_stale(Instant::now());
                        if reaped > 0 {
                            tracing::debug!(reaped, "reaper sweep");
                        }
                    }
                }
            }
            tracing::debug!("reaper stopped");
        }));
    }

    /// Clear the current day's attendance at each of `times` (local time).
    pub fn spawn_daily_reset(&mut self, ledger: Arc<AttendanceLedger>, times: Vec<NaiveTime>) {
        if times.is_empty() {
            tracing::info!("no daily reset times configured");
            return;
        }
        let mut stop = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let now = chrono::Local::now().naive_local();
                let Some(next) = next_reset_after(now, &times) else { break };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tracing::info!(at = %next, "next attendance reset scheduled");

                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                let ledger = Arc::clone(&ledger);
                let today = chrono::Local::now().date_naive();
                match tokio::task::spawn_blocking(move || ledger.clear_day(today)).await {
                    Ok(Ok(removed)) => tracing::info!(date = %today, removed, "daily attendance reset"),
                    Ok(Err(e)) => tracing::error!(date = %today, error = %e, "daily reset failed"),
                    Err(e) => tracing::error!(error = %e, "daily reset task failed"),
                }
            }
            tracing::debug!("reset task stopped");
        }));
    }

    /// Signal every task and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "scheduled task ended abnormally");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
