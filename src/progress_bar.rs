//! Chunk progress reporting.
//!
//! Components
//! -----------------
//! * [`IterTimer`] – Per-iteration durations with an exponential moving average
//!   `ema ← α·dt + (1–α)·ema`; the first tick initializes the average.
//! * [`fmt_dur`] – Human-readable [`Duration`] (`"253µs"`, `"42ms"`, `"3.14s"`).
//! * [`ChunkProgress`] – Progress over the chunks of a run, shared by the workers. With
//!   the `progress` feature it drives an `indicatif` bar; without it only the timer runs.
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};

pub struct IterTimer {
    last: Instant,
    ema_ns: f64,
    alpha: f64,
    count: u64,
}

impl IterTimer {
    pub fn new(alpha: f64) -> Self {
        Self {
            last: Instant::now(),
            ema_ns: 0.0,
            alpha,
            count: 0,
        }
    }

    #[inline]
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let dt = now.duration_since(self.last);
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

    #[inline]
    pub fn avg(&self) -> Duration {
        if self.count == 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(self.ema_ns as u64)
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

#[inline]
pub fn fmt_dur(d: Duration) -> String {
    let us = d.as_micros();
    if us < 1_000 {
        format!("{us}µs")
    } else {
        let ms = d.as_millis();
        if ms < 1_000 {
            format!("{ms}ms")
        } else {
            let s = d.as_secs_f32();
            format!("{s:.2}s")
        }
    }
}

/// Progress over the chunks of one run.
pub struct ChunkProgress {
    #[cfg(feature = "progress")]
    bar: ProgressBar,
    timer: Mutex<IterTimer>,
}

impl ChunkProgress {
    pub fn new(total: usize) -> Self {
        #[cfg(feature = "progress")]
        let bar = {
            let pb = ProgressBar::new((total as u64).max(1));
            if let Ok(style) = ProgressStyle::with_template(
                "{bar:40.cyan/blue} {pos}/{len} chunks ({percent:>3}%) | ETA {eta_precise} | {msg}",
            ) {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(200));
            pb
        };
        #[cfg(not(feature = "progress"))]
        let _ = total;

        ChunkProgress {
            #[cfg(feature = "progress")]
            bar,
            timer: Mutex::new(IterTimer::new(0.2)),
        }
    }

    /// Record one finished chunk, identified by its `"{k} of {K}:"` label.
    pub fn chunk_done(&self, label: &str) {
        let Ok(mut timer) = self.timer.lock() else {
            return;
        };
        let last = timer.tick();
        let avg = timer.avg();
        #[cfg(feature = "progress")]
        {
            self.bar.set_message(format!(
                "{label} last: {}, avg: {}",
                fmt_dur(last),
                fmt_dur(avg)
            ));
            self.bar.inc(1);
        }
        #[cfg(not(feature = "progress"))]
        let _ = (label, last, avg);
    }

    /// Number of chunks recorded so far.
    pub fn done(&self) -> u64 {
        self.timer.lock().map(|t| t.count()).unwrap_or(0)
    }

    /// Smoothed time between two finished chunks.
    pub fn avg_chunk_time(&self) -> Duration {
        self.timer.lock().map(|t| t.avg()).unwrap_or_default()
    }

    pub fn finish(self) {
        #[cfg(feature = "progress")]
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod progress_bar_test {
    use super::*;

    #[test]
    fn test_fmt_dur() {
        assert_eq!(fmt_dur(Duration::from_micros(253)), "253µs");
        assert_eq!(fmt_dur(Duration::from_millis(42)), "42ms");
        assert_eq!(fmt_dur(Duration::from_millis(3140)), "3.14s");
    }

    #[test]
    fn test_timer_average() {
        let mut timer = IterTimer::new(1.0);
        assert_eq!(timer.avg(), Duration::ZERO);
        let dt = timer.tick();
        // alpha = 1 keeps the last sample
        assert_eq!(timer.avg().as_nanos(), dt.as_nanos());
    }

    #[test]
    fn test_chunk_progress_counts() {
        let progress = ChunkProgress::new(3);
        progress.chunk_done("1 of 3:");
        progress.chunk_done("2 of 3:");
        assert_eq!(progress.done(), 2);
        progress.finish();
    }
}
