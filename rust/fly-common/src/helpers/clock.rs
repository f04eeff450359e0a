use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::Clock;

#[derive(Debug)]
struct ManualClockState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

/// A [Clock] whose time only moves when something sleeps on it (or when it is
/// advanced explicitly). Every requested sleep is recorded so tests can assert
/// on the backoff schedule without really waiting.
#[derive(Clone, Debug)]
pub struct ManualClock {
    origin: Instant,
    unix_origin: u64,
    state: Arc<Mutex<ManualClockState>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at_unix_time(1_700_000_000)
    }
}

impl ManualClock {
    /// Start a [ManualClock] whose wall-clock reads `unix_time` seconds
    pub fn at_unix_time(unix_time: u64) -> Self {
        ManualClock {
            origin: Instant::now(),
            unix_origin: unix_time,
            state: Arc::new(Mutex::new(ManualClockState {
                elapsed: Duration::ZERO,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Move time forward without recording a sleep
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.elapsed += duration;
    }

    /// Total virtual time that has passed since the clock was created
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Every sleep requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().sleeps.clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn unix_time(&self) -> u64 {
        self.unix_origin + self.elapsed().as_secs()
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut state = self.state.lock();
            state.elapsed += duration;
            state.sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}
