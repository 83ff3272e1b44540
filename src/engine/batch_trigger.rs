/// Counts admitted events and signals when a batch is due.
///
/// The count only goes back to zero through [`BatchTrigger::reset`], which the detector
/// calls after a batch fully commits. A failed batch leaves the count at or above the
/// threshold, so the next event retries it.
#[derive(Debug, Clone)]
pub struct BatchTrigger {
    threshold: u64,
    count: u64,
}

impl BatchTrigger {
    pub fn new(threshold: u64) -> Self {
        Self { threshold: threshold.max(1), count: 0 }
    }

    pub fn increment(&mut self) {
        self.count += 1;
    }

    pub fn should_flush(&self) -> bool {
        self.count >= self.threshold
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}
