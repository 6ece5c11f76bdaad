// Copyright (c) 2024 Mike Tsao

use atomic_float::AtomicF64;
use core::sync::atomic::Ordering;

/// EMA time constant for the average load readout, in seconds.
const AVERAGE_TAU: f64 = 1.0;

/// The max readout covers roughly two of these windows, in seconds.
const MAX_WINDOW: f64 = 1.0;

/// Tracks how much of each block's real-time budget the engine is spending.
///
/// The block scheduler records one sample per block: elapsed wall-clock time
/// divided by the block's duration (1.0 = exactly keeping up). Readers see an
/// exponential moving average plus a moving maximum over a ~2 s horizon. One
/// writer, any number of readers, no locks.
#[derive(Debug, Default)]
pub(crate) struct Meter {
    average: AtomicF64,
    window_max: AtomicF64,
    prev_window_max: AtomicF64,
    window_start: AtomicF64,
}
impl Meter {
    /// Records one block: `load` is elapsed/duration, `duration` is the
    /// block's span in seconds, `now` is seconds on the engine's monotonic
    /// clock.
    pub fn record(&self, load: f64, duration: f64, now: f64) {
        let alpha = 1.0 - (-duration / AVERAGE_TAU).exp();
        let average = self.average.load(Ordering::Relaxed);
        self.average
            .store(average + (load - average) * alpha, Ordering::Relaxed);

        if now - self.window_start.load(Ordering::Relaxed) >= MAX_WINDOW {
            self.prev_window_max
                .store(self.window_max.load(Ordering::Relaxed), Ordering::Relaxed);
            self.window_max.store(load, Ordering::Relaxed);
            self.window_start.store(now, Ordering::Relaxed);
        } else if load > self.window_max.load(Ordering::Relaxed) {
            self.window_max.store(load, Ordering::Relaxed);
        }
    }

    pub fn average(&self) -> f64 {
        self.average.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> f64 {
        self.window_max
            .load(Ordering::Relaxed)
            .max(self.prev_window_max.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use more_asserts::{assert_gt, assert_lt};

    #[test]
    fn average_converges_toward_steady_load() {
        let meter = Meter::default();
        let mut now = 0.0;
        for _ in 0..1000 {
            meter.record(0.5, 0.01, now);
            now += 0.01;
        }
        assert_lt!((meter.average() - 0.5).abs(), 1e-3);
    }

    #[test]
    fn max_holds_spikes_for_the_horizon_then_forgets() {
        let meter = Meter::default();
        meter.record(2.0, 0.01, 0.0);
        assert_eq!(meter.max(), 2.0, "a spike should register immediately");

        // Still visible one window later (it lives in the previous bucket).
        meter.record(0.1, 0.01, 1.5);
        assert_eq!(meter.max(), 2.0);

        // Gone after both buckets roll.
        meter.record(0.1, 0.01, 3.0);
        assert_lt!(meter.max(), 2.0);
    }

    #[test]
    fn average_tracks_rising_load() {
        let meter = Meter::default();
        meter.record(0.2, 0.1, 0.0);
        let low = meter.average();
        meter.record(1.5, 0.1, 0.1);
        assert_gt!(meter.average(), low);
    }
}
