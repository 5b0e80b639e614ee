use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Admits at most `max_starts` callers per rolling `window`.
///
/// Each admission records its start time; a caller that finds the window
/// full sleeps until the oldest start falls out of it.
#[derive(Debug)]
pub struct RateLimiter {
    max_starts: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// `max_starts == 0` disables the limit.
    pub fn new(max_starts: usize, window: Duration) -> Self {
        Self {
            max_starts,
            window,
            starts: Mutex::new(VecDeque::with_capacity(max_starts)),
        }
    }

    pub fn per_second(max_starts: usize) -> Self {
        Self::new(max_starts, Duration::from_secs(1))
    }

    pub async fn acquire(&self) {
        if self.max_starts == 0 {
            return;
        }

        loop {
            let wait = {
                let mut starts = self.starts.lock();
                let now = Instant::now();
                while starts
                    .front()
                    .is_some_and(|start| now.duration_since(*start) >= self.window)
                {
                    starts.pop_front();
                }

                if starts.len() < self.max_starts {
                    starts.push_back(now);
                    return;
                }
                starts
                    .front()
                    .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                    .unwrap_or_default()
            };
            tokio::time::sleep(wait).await;
        }
    }
}
