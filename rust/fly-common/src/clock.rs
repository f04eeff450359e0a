use async_trait::async_trait;
use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// A source of time and a way to wait for it to pass. Anything that backs off,
/// polls or checks expiration takes a [Clock] so that tests can substitute a
/// virtual one (see `helpers::ManualClock`).
#[async_trait]
pub trait Clock: Send + Sync {
    /// A monotonic reading, used to measure elapsed time
    fn now(&self) -> Instant;

    /// Wall-clock time as whole seconds since the UNIX epoch
    fn unix_time(&self) -> u64;

    /// Suspend the current task for (at least) the given [Duration]
    async fn sleep(&self, duration: Duration);
}

/// The [Clock] of the host system, sleeping via [tokio::time::sleep]
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or_default()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A shareable, type-erased [Clock]
pub type SharedClock = Arc<dyn Clock>;

/// Get a [SharedClock] backed by the [SystemClock]
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
