//! Periodic liveness report.
//!
//! Reads the global metrics the control loop maintains and logs a
//! throughput summary on a fixed cadence. Diagnostic only; nothing in the
//! serving path depends on it.

use std::time::{Duration, Instant};

use genloop_common::METRICS;
use tokio::task::JoinHandle;
use tracing::info;

/// Spawn the watchdog task. The handle is held for the process lifetime;
/// the task never exits on its own.
pub fn spawn(interval: Duration) -> JoinHandle<()> {
    let started = Instant::now();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so reports start
        // one full interval in.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let tokens = METRICS.tokens_generated_total.get();
            let elapsed = started.elapsed().as_secs_f64();
            info!(
                active_tasks = METRICS.active_tasks.get(),
                tokens_generated = tokens,
                tokens_per_sec = tokens as f64 / elapsed.max(1.0),
                frames_sent = METRICS.frames_sent_total.get(),
                reconnects = METRICS.reconnects_total.get(),
                "node liveness"
            );
        }
    })
}
