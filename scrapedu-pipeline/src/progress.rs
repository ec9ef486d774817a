//! Periodic progress logging.

use std::sync::Arc;
use std::time::Duration;

use scrapedu_core::Manifest;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Log per-status counts every `interval` until `stop` is cancelled.
pub(crate) fn spawn_reporter(
    manifest: Arc<Manifest>,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let counts = manifest.summary();
                    tracing::info!(
                        pending = counts.pending,
                        claimed = counts.claimed,
                        completed = counts.completed,
                        failed = counts.failed,
                        "progress"
                    );
                }
            }
        }
    })
}

/// `12.3s` below a minute, `4m07s` above.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{:.1}s", elapsed.as_secs_f64())
    } else if secs < 3_600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3_600, (secs % 3_600) / 60)
    }
}
