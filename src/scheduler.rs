//! Translation scheduler: one long-lived tokio task per pipeline.
//! Sleeps while translation is disabled or the queue is empty, otherwise runs
//! one cycle per tick. Only one cycle's backend call is ever in flight.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pipeline::Pipeline;

pub async fn run_translation_loop(pipeline: Pipeline, cancel: CancellationToken) {
    info!("translation scheduler started");
    let mut status_rx = pipeline.subscribe_status();

    loop {
        if !pipeline.is_enabled() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }

        if !pipeline.has_queued() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = pipeline.work_available() => {}
            }
        }

        // Frame tick: let a burst of submissions accumulate into one cycle.
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pipeline.cycle_interval()) => {}
        }

        let report = tokio::select! {
            _ = cancel.cancelled() => break,
            report = pipeline.tick() => report,
        };
        if report.taken > 0 {
            debug!(
                taken = report.taken,
                cached = report.cached,
                sent = report.sent,
                translated = report.translated,
                failed = report.failed,
                tripped = report.tripped,
                "cycle finished"
            );
        }
    }

    info!("translation scheduler exiting");
}
