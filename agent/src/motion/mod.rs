pub mod detector;
pub mod policy;

use std::sync::Arc;
use std::time::Duration;

use surveil_common::config::MotionConfig;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::session::Session;
use detector::MotionDetector;

/// Sample the latest camera frame on a fixed cadence and feed the magnitude
/// to the session's trigger policy. Runs until the task is aborted.
///
/// Ticks never overlap: decoding and evaluation finish before the next tick
/// is scheduled. Without a frame the tick is a no-op.
pub async fn run_sampling_loop(session: Arc<Session>, config: MotionConfig) {
    let mut frames = session.subscribe_frames();
    let mut detector = MotionDetector::new(&config);
    let mut ticker = tokio::time::interval(Duration::from_millis(config.sample_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks: u64 = 0;

    loop {
        ticker.tick().await;

        let Some(frame) = frames.borrow_and_update().clone() else {
            continue;
        };

        // JPEG decode is CPU-bound; keep it off the async workers.
        let (returned, result) = match tokio::task::spawn_blocking(move || {
            let result = detector.tick(&frame);
            (detector, result)
        })
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "sampling task failed, resetting motion baseline");
                detector = MotionDetector::new(&config);
                continue;
            }
        };
        detector = returned;

        let magnitude = match result {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to sample frame, skipping tick");
                continue;
            }
        };

        ticks += 1;
        if ticks % 100 == 0 {
            debug!(ticks, "sampling ticks processed");
        }

        session
            .apply_motion(magnitude, config.magnitude_threshold)
            .await;
    }
}
