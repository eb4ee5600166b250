//! Progress reporting of a scan run.
//!
//! With the `progress` feature, [`ScanProgress`] drives an `indicatif` bar
//! whose message shows the last and smoothed duration of one output sample
//! (see [`SampleTimer`]). Without it, every method is a no-op and callers do
//! not need their own `cfg` guards.
#[cfg(feature = "progress")]
use std::time::{Duration, Instant};

#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};

/// Per-sample durations with an exponential moving average,
/// `ema ← α·dt + (1–α)·ema`. The first tick seeds the average.
#[cfg(feature = "progress")]
pub(crate) struct SampleTimer {
    last: Instant,
    ema_ns: f64,
    alpha: f64,
    count: u64,
}

#[cfg(feature = "progress")]
impl SampleTimer {
    pub(crate) fn new(alpha: f64) -> Self {
        Self {
            last: Instant::now(),
            ema_ns: 0.0,
            alpha,
            count: 0,
        }
    }

    /// Record `samples` completed since the last tick; returns the duration of one.
    pub(crate) fn tick(&mut self, samples: u64) -> Duration {
        let now = Instant::now();
        let dt = now.duration_since(self.last) / samples.max(1) as u32;
        self.last = now;
        self.count += 1;

        let dt_ns = dt.as_nanos() as f64;
        self.ema_ns = if self.count == 1 {
            dt_ns
        } else {
            self.alpha * dt_ns + (1.0 - self.alpha) * self.ema_ns
        };
        dt
    }

    pub(crate) fn avg(&self) -> Duration {
        if self.count == 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(self.ema_ns as u64)
        }
    }
}

#[cfg(feature = "progress")]
pub(crate) fn fmt_dur(d: Duration) -> String {
    let us = d.as_micros();
    if us < 1_000 {
        format!("{us}µs")
    } else {
        let ms = d.as_millis();
        if ms < 1_000 {
            format!("{ms}ms")
        } else {
            format!("{:.2}s", d.as_secs_f32())
        }
    }
}

pub(crate) struct ScanProgress {
    #[cfg(feature = "progress")]
    bar: ProgressBar,
    #[cfg(feature = "progress")]
    timer: SampleTimer,
}

impl ScanProgress {
    #[cfg(feature = "progress")]
    pub(crate) fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total.max(1) as u64);
        let style = ProgressStyle::with_template(
            "{bar:40.cyan/blue} {pos}/{len} ({percent:>3}%) | {per_sec} | ETA {eta_precise} | {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(200));
        ScanProgress {
            bar,
            timer: SampleTimer::new(0.2),
        }
    }

    #[cfg(not(feature = "progress"))]
    pub(crate) fn new(_total: usize) -> Self {
        ScanProgress {}
    }

    /// Advance by `samples` completed output samples.
    #[cfg(feature = "progress")]
    pub(crate) fn inc(&mut self, samples: usize) {
        let last = self.timer.tick(samples as u64);
        let avg = self.timer.avg();
        self.bar
            .set_message(format!("last: {}, avg: {}", fmt_dur(last), fmt_dur(avg)));
        self.bar.inc(samples as u64);
    }

    #[cfg(not(feature = "progress"))]
    #[inline]
    pub(crate) fn inc(&mut self, _samples: usize) {}

    #[cfg(feature = "progress")]
    pub(crate) fn finish(self) {
        self.bar.finish_and_clear();
    }

    #[cfg(not(feature = "progress"))]
    #[inline]
    pub(crate) fn finish(self) {}
}

#[cfg(all(test, feature = "progress"))]
mod progress_test {
    use super::*;

    #[test]
    fn test_fmt_dur() {
        assert_eq!(fmt_dur(Duration::from_micros(253)), "253µs");
        assert_eq!(fmt_dur(Duration::from_millis(42)), "42ms");
        assert_eq!(fmt_dur(Duration::from_millis(3140)), "3.14s");
    }

    #[test]
    fn test_timer_average_seeds_on_first_tick() {
        let mut timer = SampleTimer::new(0.5);
        assert_eq!(timer.avg(), Duration::from_nanos(0));
        let dt = timer.tick(1);
        assert_eq!(timer.avg().as_nanos(), dt.as_nanos());
    }
}
