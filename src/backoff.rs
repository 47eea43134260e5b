/// Retry budget with exponential delays for LLM requests.
///
/// Hands out at most `retries` delays. Each one is `factor` times the
/// previous, never more than `ceiling`.
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    ceiling: Duration,
    factor: u32,
    retries: u32,
    /// Delays handed out so far
    pub attempt: u32,
}

impl Backoff {
    pub fn new(first: Duration, ceiling: Duration, factor: u32, retries: u32) -> Self {
        Self {
            next: first.min(ceiling),
            ceiling,
            factor,
            retries,
            attempt: 0,
        }
    }

    /// 1s, 2s, 4s … capped at 10s.
    pub fn for_llm(retries: u32) -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10), 2, retries)
    }

    /// The delay before the next retry, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.retries {
            return None;
        }
        let delay = self.next;
        self.attempt += 1;
        self.next = self
            .next
            .checked_mul(self.factor)
            .map_or(self.ceiling, |d| d.min(self.ceiling));
        Some(delay)
    }
}
