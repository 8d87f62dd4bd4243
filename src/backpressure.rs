//! Backpressure observation. The queue is unbounded, so the only sign
//! that the downstream consumer cannot keep up is the queue length
//! growing; the sender checks each drained batch against a threshold
//! and emits a rate-limited warning line.

use std::{
    fs::{File, OpenOptions},
    io::{stderr, Write},
    path::Path,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};

/// Threshold plus warning rate limit. Mutated only by the sender
/// loop, not shared.
pub struct WarnRateLimit {
    threshold: usize,
    min_interval: Duration,
    last_warning: Option<Instant>,
}

impl WarnRateLimit {
    pub fn new(threshold: usize, min_interval: Duration) -> Self {
        WarnRateLimit {
            threshold,
            min_interval,
            last_warning: None,
        }
    }

    /// Whether a warning is due for an observed queue length of
    /// `queue_len`; updates the warning time when it says yes.
    pub fn should_warn(&mut self, queue_len: usize) -> bool {
        if queue_len <= self.threshold {
            return false;
        }
        let now = Instant::now();
        match self.last_warning {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_warning = Some(now);
                true
            }
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

/// Where warning lines go: stderr by default, or an append-opened
/// file.
pub enum WarnSink {
    Stderr,
    File(File),
}

impl WarnSink {
    pub fn open(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            None => Ok(WarnSink::Stderr),
            Some(path) => {
                // Can`t use `File::create` since earlier warnings
                // (e.g. from a previous run) should be kept.
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| anyhow!("opening warning sink {path:?} for appending"))?;
                Ok(WarnSink::File(file))
            }
        }
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        match self {
            WarnSink::Stderr => {
                let mut err = stderr().lock();
                writeln!(err, "{line}")?;
                err.flush()
            }
            WarnSink::File(file) => {
                writeln!(file, "{line}")?;
                file.flush()
            }
        }
    }
}

pub struct Backpressure {
    limit: WarnRateLimit,
    sink: WarnSink,
}

impl Backpressure {
    pub fn new(limit: WarnRateLimit, sink: WarnSink) -> Self {
        Backpressure { limit, sink }
    }

    /// Called by the sender with the length of every non-empty
    /// drained batch.
    pub fn observe(&mut self, queue_len: usize) -> std::io::Result<()> {
        if self.limit.should_warn(queue_len) {
            self.sink.write_line(&format!(
                "Queue length too large ({queue_len} > {})",
                self.limit.threshold()
            ))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_below_threshold_never_warns() {
        let mut limit = WarnRateLimit::new(5, Duration::from_secs(0));
        assert!(!limit.should_warn(5));
        assert!(!limit.should_warn(0));
    }

    #[test]
    fn t_at_most_one_warning_per_interval() {
        let mut limit = WarnRateLimit::new(5, Duration::from_secs(3600));
        assert!(limit.should_warn(10));
        // Depth stays above threshold, but the interval has not
        // passed.
        assert!(!limit.should_warn(10));
        assert!(!limit.should_warn(100));
    }

    #[test]
    fn t_zero_interval_warns_every_time() {
        let mut limit = WarnRateLimit::new(5, Duration::from_secs(0));
        assert!(limit.should_warn(6));
        assert!(limit.should_warn(6));
    }
}
