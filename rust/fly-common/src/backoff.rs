use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Duration;

/// How the nominal backoff interval is randomized before it is used as a delay
#[derive(Clone, Debug, PartialEq)]
pub enum Jitter {
    /// Use the nominal interval as-is
    None,
    /// Pick uniformly from `[0, interval]`
    Full,
    /// Pick uniformly from `[interval * (1 - factor), interval * (1 + factor)]`
    Proportional(f64),
}

/// A usable proportional factor, or `None` if it is not a finite number
fn proportion(factor: f64) -> Option<f64> {
    factor.is_finite().then(|| factor.clamp(0.0, 1.0))
}

impl Jitter {
    fn apply<R: Rng>(&self, interval: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => interval,
            Jitter::Full => {
                let nanos = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
                Duration::from_nanos(rng.gen_range(0..=nanos))
            }
            Jitter::Proportional(factor) => {
                let Some(factor) = proportion(*factor) else {
                    return interval;
                };
                let nominal = interval.as_secs_f64();
                let low = nominal * (1.0 - factor);
                let high = nominal * (1.0 + factor);
                if high <= low {
                    return interval;
                }
                Duration::try_from_secs_f64(rng.gen_range(low..=high)).unwrap_or(interval)
            }
        }
    }

    /// The largest delay this strategy can produce for the given interval
    pub fn upper_bound(&self, interval: Duration) -> Duration {
        match self {
            Jitter::None | Jitter::Full => interval,
            Jitter::Proportional(factor) => match proportion(*factor) {
                Some(factor) => Duration::try_from_secs_f64(interval.as_secs_f64() * (1.0 + factor))
                    .unwrap_or(interval),
                None => interval,
            },
        }
    }
}

/// The static description of an exponential backoff: where it starts, how it
/// grows, how it is randomized and when it gives up.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    /// Nominal delay after the first failed attempt
    pub initial_interval: Duration,
    /// Upper bound of the nominal delay
    pub max_interval: Duration,
    /// Growth factor applied to the nominal delay after every failed attempt
    pub multiplier: f64,
    /// Randomization applied to each delay
    pub jitter: Jitter,
    /// Give up once waiting again would push the total elapsed time past this
    pub max_elapsed_time: Option<Duration>,
    /// Give up after this many attempts (the first attempt counts)
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::flaps()
    }
}

impl BackoffPolicy {
    /// The policy used for operation-level retries against the Machines API:
    /// 100ms growing by 2x up to 500ms, randomized by 50%, for up to a minute
    pub fn flaps() -> Self {
        BackoffPolicy {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: Jitter::Proportional(0.5),
            max_elapsed_time: Some(Duration::from_secs(60)),
            max_attempts: None,
        }
    }

    /// The policy used for retrying individual HTTP round trips: at most four
    /// attempts, full-jitter delays from 100ms capped at 1s, for up to a minute
    pub fn transport() -> Self {
        BackoffPolicy {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: Jitter::Full,
            max_elapsed_time: Some(Duration::from_secs(60)),
            max_attempts: Some(4),
        }
    }

    /// Set the nominal delay after the first failed attempt
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the upper bound of the nominal delay
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the growth factor of the nominal delay
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the [Jitter] strategy
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set (or clear) the total elapsed time ceiling
    pub fn with_max_elapsed_time(mut self, max_elapsed_time: Option<Duration>) -> Self {
        self.max_elapsed_time = max_elapsed_time;
        self
    }

    /// Set (or clear) the attempt ceiling
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// The mutable half of a [BackoffPolicy]: counts attempts and yields the delay
/// to wait before the next one, or `None` once the policy is exhausted.
///
/// ```rust
/// # use fly_common::{Backoff, BackoffPolicy, Jitter};
/// # use std::time::Duration;
/// let policy = BackoffPolicy::transport().with_jitter(Jitter::None);
/// let mut backoff = Backoff::new(policy);
///
/// assert_eq!(backoff.next_delay(Duration::ZERO), Some(Duration::from_millis(100)));
/// assert_eq!(backoff.next_delay(Duration::ZERO), Some(Duration::from_millis(200)));
/// assert_eq!(backoff.next_delay(Duration::ZERO), Some(Duration::from_millis(400)));
/// assert_eq!(backoff.next_delay(Duration::ZERO), None);
/// ```
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
    current_interval: Duration,
    rng: StdRng,
}

impl Backoff {
    /// Start a [Backoff] with an entropy-seeded random source
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// Start a [Backoff] whose jitter is reproducible for a given seed
    pub fn with_seed(policy: BackoffPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: BackoffPolicy, rng: StdRng) -> Self {
        let current_interval = policy.initial_interval;
        Backoff {
            policy,
            attempts: 0,
            current_interval,
            rng,
        }
    }

    /// The [BackoffPolicy] driving this [Backoff]
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// The number of failed attempts recorded so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt, `elapsed` after the first attempt started.
    /// Returns the delay to wait before the next attempt, or `None` if the
    /// attempt ceiling was reached or waiting would exceed the elapsed time
    /// ceiling.
    pub fn next_delay(&mut self, elapsed: Duration) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);

        if let Some(max_attempts) = self.policy.max_attempts {
            if self.attempts >= max_attempts {
                return None;
            }
        }

        let delay = self.policy.jitter.apply(self.current_interval, &mut self.rng);

        if let Some(max_elapsed_time) = self.policy.max_elapsed_time {
            if elapsed.saturating_add(delay) > max_elapsed_time {
                return None;
            }
        }

        self.current_interval = Duration::try_from_secs_f64(
            self.current_interval.as_secs_f64() * self.policy.multiplier,
        )
        .unwrap_or(self.policy.max_interval)
        .min(self.policy.max_interval);

        Some(delay)
    }

    /// Forget all recorded attempts
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_interval = self.policy.initial_interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_caps_the_nominal_interval() {
        let policy = BackoffPolicy::flaps()
            .with_jitter(Jitter::None)
            .with_max_elapsed_time(None);
        let mut backoff = Backoff::new(policy);

        let delays: Vec<Duration> = (0..5)
            .filter_map(|_| backoff.next_delay(Duration::ZERO))
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn it_gives_up_when_the_elapsed_ceiling_would_be_exceeded() {
        let policy = BackoffPolicy::flaps()
            .with_jitter(Jitter::None)
            .with_max_elapsed_time(Some(Duration::from_secs(1)));
        let mut backoff = Backoff::new(policy);

        assert_eq!(
            backoff.next_delay(Duration::from_millis(850)),
            Some(Duration::from_millis(100))
        );
        assert_eq!(backoff.next_delay(Duration::from_millis(950)), None);
    }

    #[test]
    fn it_keeps_jittered_delays_within_bounds() {
        let full = BackoffPolicy::transport().with_max_attempts(None);
        let mut backoff = Backoff::with_seed(full, 7);
        let mut nominal = Duration::from_millis(100);
        for _ in 0..16 {
            let delay = backoff.next_delay(Duration::ZERO).unwrap();
            assert!(delay <= nominal);
            nominal = (nominal * 2).min(Duration::from_secs(1));
        }

        let proportional = BackoffPolicy::flaps().with_max_elapsed_time(None);
        let mut backoff = Backoff::with_seed(proportional, 7);
        let delay = backoff.next_delay(Duration::ZERO).unwrap();
        assert!(delay >= Duration::from_millis(50));
        assert!(delay <= Duration::from_millis(150));
    }

    #[test]
    fn it_falls_back_to_the_nominal_delay_for_unusable_factors() {
        for factor in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let policy = BackoffPolicy::flaps().with_jitter(Jitter::Proportional(factor));
            let mut backoff = Backoff::with_seed(policy.clone(), 7);

            assert_eq!(
                backoff.next_delay(Duration::ZERO),
                Some(Duration::from_millis(100))
            );
            assert_eq!(
                policy.jitter.upper_bound(Duration::from_millis(100)),
                Duration::from_millis(100)
            );
        }
    }

    #[test]
    fn it_starts_over_after_a_reset() {
        let policy = BackoffPolicy::transport().with_jitter(Jitter::None);
        let mut backoff = Backoff::new(policy);

        while backoff.next_delay(Duration::ZERO).is_some() {}
        assert_eq!(backoff.attempts(), 4);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(
            backoff.next_delay(Duration::ZERO),
            Some(Duration::from_millis(100))
        );
    }
}
