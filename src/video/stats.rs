//! Pipeline throughput statistics and stale-output detection (§4.9).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::utils::throttle::LogThrottler;

const REPORT_INTERVAL: Duration = Duration::from_secs(20);
const STALE_WARN_INTERVAL: Duration = Duration::from_secs(2);

/// Rolling counters for one direction of the pipeline (input or output).
#[derive(Debug, Default)]
struct Counters {
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl Counters {
    fn record(&self, len: usize) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64) {
        (self.frames.load(Ordering::Relaxed), self.bytes.load(Ordering::Relaxed))
    }
}

/// Tracks input/output frame and byte counts for one video pipeline, logging
/// a periodic summary and warning if output stalls while input keeps flowing.
pub struct Statistics {
    input: Counters,
    output: Counters,
    last_report: Mutex<Instant>,
    last_output_at: Mutex<Instant>,
    stale_throttle: LogThrottler,
}

impl Statistics {
    pub fn new() -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            input: Counters::default(),
            output: Counters::default(),
            last_report: Mutex::new(now),
            last_output_at: Mutex::new(now),
            stale_throttle: LogThrottler::new(STALE_WARN_INTERVAL),
        })
    }

    pub fn record_input_frame(&self, bytes: usize) {
        self.input.record(bytes);
        self.maybe_report();
    }

    pub fn record_output_frame(&self, bytes: usize) {
        self.output.record(bytes);
        *self.last_output_at.lock() = Instant::now();
    }

    /// Call periodically from the pipeline's supervisor loop: logs a warning
    /// (throttled to once per 2s) if input is flowing but output has stalled.
    pub fn check_stale_output(&self, max_silence: Duration) {
        let (input_frames, _) = self.input.snapshot();
        if input_frames == 0 {
            return;
        }
        let silence = self.last_output_at.lock().elapsed();
        if silence > max_silence && self.stale_throttle.should_log("stale_output") {
            tracing::warn!(
                silence_ms = silence.as_secs_f64() * 1000.0,
                "encoder output has stalled while input frames keep arriving"
            );
        }
    }

    fn maybe_report(&self) {
        let mut last_report = self.last_report.lock();
        if last_report.elapsed() < REPORT_INTERVAL {
            return;
        }
        *last_report = Instant::now();

        let (in_frames, in_bytes) = self.input.snapshot();
        let (out_frames, out_bytes) = self.output.snapshot();
        let ratio = if out_bytes > 0 {
            in_bytes as f64 / out_bytes as f64
        } else {
            0.0
        };

        tracing::info!(
            input_frames = in_frames,
            input_bytes = in_bytes,
            output_frames = out_frames,
            output_bytes = out_bytes,
            compression_ratio = ratio,
            "pipeline stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_independently() {
        let stats = Statistics::new();
        stats.record_input_frame(1000);
        stats.record_input_frame(2000);
        stats.record_output_frame(100);

        assert_eq!(stats.input.snapshot(), (2, 3000));
        assert_eq!(stats.output.snapshot(), (1, 100));
    }

    #[test]
    fn stale_output_warns_only_after_input_with_no_output() {
        let stats = Statistics::new();
        // No input yet: never stale.
        stats.check_stale_output(Duration::from_millis(0));

        stats.record_input_frame(1000);
        std::thread::sleep(Duration::from_millis(5));
        // Should not panic; exact log assertion isn't observable here, just
        // exercising the code path with a threshold guaranteed to trip.
        stats.check_stale_output(Duration::from_millis(1));
    }
}
