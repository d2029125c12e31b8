//! Step timings of a shard job

use std::fmt;
use std::time::{Duration, Instant};

/// Durations of consecutive job steps, each measured from the end of the
/// previous one
#[derive(Debug)]
pub struct StepTimings {
    origin: Instant,
    mark: Instant,
    steps: Vec<(&'static str, Duration)>,
}

impl StepTimings {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            origin: now,
            mark: now,
            steps: Vec::new(),
        }
    }

    /// Close the running step under `name` and return its duration
    pub fn finish(&mut self, name: &'static str) -> Duration {
        let now = Instant::now();
        let took = now.saturating_duration_since(self.mark);
        self.mark = now;
        self.steps.push((name, took));
        took
    }

    pub fn slowest(&self) -> Option<(&'static str, Duration)> {
        self.steps.iter().copied().max_by_key(|(_, took)| *took)
    }

    pub fn total(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl fmt::Display for StepTimings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, took) in &self.steps {
            write!(f, "{}={}ms ", name, took.as_millis())?;
        }
        write!(f, "total={}ms", self.total().as_millis())
    }
}
