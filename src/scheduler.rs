//! Background refresh loop
//!
//! Keeps the caches warm by recomputing everything every
//! `refreshIntervalMinutes`:
//! - Interval 0 disables the loop
//! - Sleep/wake detection via wall-clock jumps triggers an immediate refresh
//! - A failed refresh is logged and retried on the next tick

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::services;
use crate::state::EngineState;

/// Time jump threshold to detect sleep/wake (5 minutes)
const TIME_JUMP_THRESHOLD_SECS: i64 = 300;

/// Upper bound on the poll interval (1 minute)
const MAX_POLL_INTERVAL_SECS: u64 = 60;

pub struct Scheduler {
    state: Arc<EngineState>,
    interval: Duration,
}

impl Scheduler {
    /// `None` when the configured interval is 0.
    pub fn new(state: Arc<EngineState>) -> Option<Self> {
        let minutes = state.config.refresh_interval_minutes;
        if minutes == 0 {
            log::info!("Background refresh disabled");
            return None;
        }
        Some(Self {
            state,
            interval: Duration::from_secs(minutes * 60),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn poll_interval(&self) -> Duration {
        self.interval.min(Duration::from_secs(MAX_POLL_INTERVAL_SECS))
    }

    /// Start the loop on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Run indefinitely, refreshing once per interval.
    pub async fn run(&self) {
        log::info!("Background refresh every {:?}", self.interval);
        let mut last_refresh = Instant::now();
        let mut last_check = Utc::now();

        loop {
            tokio::time::sleep(self.poll_interval()).await;

            let now = Utc::now();
            let time_jump = (now - last_check).num_seconds();
            last_check = now;

            let woke = time_jump > TIME_JUMP_THRESHOLD_SECS;
            if woke {
                log::info!(
                    "Detected system wake (time jumped {} seconds), refreshing now",
                    time_jump
                );
            }

            if woke || last_refresh.elapsed() >= self.interval {
                self.tick().await;
                last_refresh = Instant::now();
            }
        }
    }

    async fn tick(&self) {
        if let Err(e) = services::refresh(&self.state).await {
            log::warn!("Scheduled refresh failed, keeping cached results: {}", e);
        }
    }
}
