use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Fixtures disconnect clients that exceed roughly one request per second
/// sustained; this is the documented quota.
pub const MAX_REQUESTS_PER_WINDOW: usize = 60;
pub const ADMISSION_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window limiter for outgoing requests on one fixture session.
///
/// `admit` never drops or rejects; when the window is full it suspends the
/// caller until the oldest admission ages out. Admission timestamps use
/// `tokio::time::Instant`, so tests can drive the window with paused time.
#[derive(Debug)]
pub struct RateLimiter {
    max: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Block until the caller may send, then record the admission.
    ///
    /// Safe under concurrent admission: the slot check and the admission
    /// record happen under one lock, and sleepers re-check on wake because
    /// another caller may have taken the freed slot first.
    pub async fn admit(&self) {
        loop {
            let deadline = {
                let mut timestamps = self.timestamps.lock().await;
                let now = Instant::now();
                while timestamps
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    timestamps.pop_front();
                }
                match timestamps.front() {
                    Some(oldest) if timestamps.len() >= self.max => *oldest + self.window,
                    _ => {
                        timestamps.push_back(now);
                        return;
                    }
                }
            };
            tokio::time::sleep_until(deadline).await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(MAX_REQUESTS_PER_WINDOW, ADMISSION_WINDOW)
    }
}
