use std::time::Duration;

/// A fixed backoff strategy: the same delay between every retry. Combine with
/// `Iterator::take` to bound the number of retries.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    delay: Duration,
}

impl Interval {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.delay)
    }
}
