use std::time::{Duration, Instant};

use super::identity::epoch_ms;

// ---------------------------------------------------------------------------
// Circuit breaker: Closed -> Open -> HalfOpen -> Closed
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Stops hammering a seed that keeps failing. After `failure_threshold`
/// consecutive failures the circuit opens for `cooldown`; one probe is then
/// allowed and decides whether it closes again.
pub(crate) struct CircuitBreaker {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
            failure_threshold,
            cooldown,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Time left before a probe is allowed, or `None` if we may dial now.
    pub fn wait_time(&mut self) -> Option<Duration> {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => None,
            CircuitState::Open => {
                let elapsed = self.opened_at.map_or(self.cooldown, |t| t.elapsed());
                if elapsed >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                    None
                } else {
                    Some(self.cooldown - elapsed)
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failures += 1;
                if self.failures >= self.failure_threshold {
                    self.open();
                }
            }
            CircuitState::HalfOpen => self.open(),
            CircuitState::Open => {}
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
    }
}

// ---------------------------------------------------------------------------
// Exponential backoff with ±20% jitter
// ---------------------------------------------------------------------------

pub(crate) struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    const MULTIPLIER: f64 = 1.5;

    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.as_secs_f64();
        let max = self.max.as_secs_f64();
        let jitter = 0.8 + 0.4 * (epoch_ms() % 1000) as f64 / 1000.0;
        self.current = Duration::from_secs_f64((base * Self::MULTIPLIER).min(max));
        Duration::from_secs_f64((base * jitter).min(max))
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Dial policy for one seed: backoff between attempts, circuit breaker
/// across streaks of failures.
pub(crate) struct ReconnectPolicy {
    backoff: ExponentialBackoff,
    breaker: CircuitBreaker,
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self {
            backoff: ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(30)),
            breaker: CircuitBreaker::new(10, Duration::from_secs(60)),
        }
    }

    pub fn gate(&mut self) -> Option<Duration> {
        self.breaker.wait_time()
    }

    /// Records the failure and returns how long to wait before the next dial.
    pub fn on_failure(&mut self) -> Duration {
        self.breaker.record_failure();
        self.backoff.next_delay()
    }

    pub fn on_success(&mut self) {
        self.breaker.record_success();
        self.backoff.reset();
    }

    /// Delay after an established link drops. Not counted as a failure.
    pub fn retry_delay(&mut self) -> Duration {
        self.backoff.next_delay()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_after_threshold() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.wait_time().is_none());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.wait_time().is_some());
    }

    #[test]
    fn test_breaker_probe_closes_on_success() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(1));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.wait_time().is_none());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_breaker_probe_reopens_on_failure() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(1));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.wait_time().is_none());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let d1 = b.next_delay();
        assert!(d1.as_secs_f64() >= 0.79 && d1.as_secs_f64() <= 1.21);
        for _ in 0..30 {
            b.next_delay();
        }
        assert!(b.next_delay() <= Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_reset() {
        let mut b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..20 {
            b.next_delay();
        }
        b.reset();
        assert!(b.next_delay() < Duration::from_secs(2));
    }

    #[test]
    fn test_policy_resets_on_success() {
        let mut policy = ReconnectPolicy::new();
        for _ in 0..5 {
            policy.on_failure();
        }
        policy.on_success();
        assert!(policy.gate().is_none());
        assert!(policy.on_failure() < Duration::from_secs(1));
    }
}
