//! Speed, ETA and percentage accounting for a running transfer.
use std::time::{Duration, Instant};

/// Byte counters a status is computed from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    /// Plaintext bytes produced (or consumed, for backups) so far.
    pub produced: u64,
    /// Declared plaintext total, 0 while unknown.
    pub total: u64,
    /// Compressed bytes consumed so far.
    pub consumed: u64,
    /// Compressed total, 0 for raw sources.
    pub compressed_total: u64,
}

/// A snapshot for the presentation layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    /// 0 to 100.
    pub percent: u8,
    pub text: String,
    pub remaining: Option<Duration>,
}

/// Rolling speed estimate, sampled at most once per elapsed whole second.
#[derive(Clone, Debug)]
pub struct Progress {
    start: Instant,
    last_sample_secs: u64,
    speed_sum: u64,
    speed_samples: u64,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            last_sample_secs: 0,
            speed_sum: 0,
            speed_samples: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Average speed in bytes per second over the samples taken so far.
    pub fn average_speed(&self) -> Option<u64> {
        (self.speed_samples > 0).then(|| self.speed_sum / self.speed_samples)
    }

    pub fn status(&mut self, counters: &Counters) -> Status {
        let elapsed = self.elapsed();
        self.status_at(counters, elapsed)
    }

    /// Same as [`Progress::status`] with an explicit elapsed time.
    pub fn status_at(&mut self, c: &Counters, elapsed: Duration) -> Status {
        let secs = elapsed.as_secs();
        if secs > self.last_sample_secs {
            self.last_sample_secs = secs;
            let done = if c.total > 0 { c.produced } else { c.consumed };
            if done > 0 {
                self.speed_sum += done / secs;
                self.speed_samples += 1;
            }
        }

        let mut remaining = None;
        if self.speed_samples > 2 {
            if let Some(speed) = self.average_speed().filter(|&s| s > 0) {
                let left = if c.total > 0 {
                    c.total.saturating_sub(c.produced)
                } else {
                    c.compressed_total.saturating_sub(c.consumed)
                };
                remaining = Some(Duration::from_secs(left / speed));
            }
        }

        let mut text = if c.total > 0 {
            format!("{:6} MiB / {} MiB", c.produced >> 20, c.total >> 20)
        } else {
            format!("{:6} MiB so far", c.produced >> 20)
        };
        if let Some(left) = remaining {
            text.push_str(", ");
            text.push_str(&format_remaining(left));
        }

        Status {
            percent: percent(c),
            text,
            remaining,
        }
    }

    /// Final status line. Empty unless the transfer covered its whole
    /// declared size.
    pub fn finished(&self, c: &Counters, success: bool) -> Status {
        let mut status = Status {
            percent: percent(c),
            ..Default::default()
        };
        if success && c.total > 0 && c.produced >= c.total {
            status.text = format!("Done. Time elapsed {}", format_elapsed(self.elapsed()));
        }
        status
    }
}

/// Percent complete, clamped to 100. The produced count may run slightly
/// past the total because reads are rounded up to whole sectors.
pub fn percent(c: &Counters) -> u8 {
    let p = if c.total > 0 {
        c.produced.saturating_mul(100) / c.total
    } else {
        c.consumed.saturating_mul(100) / (c.compressed_total + 1)
    };
    p.min(100) as u8
}

fn plural(n: u64, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

pub fn format_remaining(left: Duration) -> String {
    let secs = left.as_secs();
    let (h, m) = (secs / 3600, (secs % 3600) / 60);
    if h > 0 {
        format!("{} {} left", plural(h, "hour"), plural(m, "minute"))
    } else if m > 0 {
        format!("{} left", plural(m, "minute"))
    } else {
        "less than a minute left".to_string()
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let s = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", s / 3600, (s % 3600) / 60, s % 60)
}
