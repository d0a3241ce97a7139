//! Per-provider call gate: sliding one-minute window, exponential backoff and
//! a circuit breaker. One instance per external provider.

use anyhow::Error;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);
const MIN_COOLDOWN_SECS: u64 = 30;
const COOLDOWN_DELAY_FACTOR: u64 = 5;

/// Time source for the limiter; swapped for a manual clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    pub rpm: usize,
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub circuit_threshold: u32,
}

impl LimiterConfig {
    fn clamped(self) -> Self {
        Self {
            rpm: self.rpm.max(1),
            max_attempts: self.max_attempts.max(1),
            base_delay_secs: self.base_delay_secs.max(1),
            circuit_threshold: self.circuit_threshold.max(1),
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(
            MIN_COOLDOWN_SECS.max(self.base_delay_secs.saturating_mul(COOLDOWN_DELAY_FACTOR)),
        )
    }

    /// `base_delay * 2^(attempt-1)`; attempt is 1-based.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        Duration::from_secs(self.base_delay_secs.saturating_mul(1u64 << exponent))
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    window: VecDeque<Instant>,
    failures: u32,
    open_until: Option<Instant>,
}

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    CircuitOpen(Duration),
    WindowFull(Duration),
}

/// Outcome of a guarded call. Errors never escape the retry wrapper.
#[derive(Debug)]
pub struct CallOutcome<T> {
    pub value: Option<T>,
    pub latency: Duration,
    pub attempts: u32,
    pub error: Option<Error>,
}

impl<T> CallOutcome<T> {
    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

pub struct RateLimiter {
    provider: String,
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("provider", &self.provider)
            .field("config", &self.config)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(provider: impl Into<String>, config: LimiterConfig) -> Self {
        Self::with_clock(provider, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        provider: impl Into<String>,
        config: LimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider: provider.into(),
            config: config.clamped(),
            clock,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> LimiterConfig {
        self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, LimiterState> {
        // state stays consistent even if a holder panicked; every mutation is a single step
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One step of the admission state machine. Reserves a slot when admitted.
    pub fn try_admit(&self) -> Admission {
        let now = self.clock.now();
        let mut state = self.lock_state();
        while let Some(oldest) = state.window.front() {
            if now.saturating_duration_since(*oldest) >= WINDOW {
                state.window.pop_front();
            } else {
                break;
            }
        }

        if let Some(open_until) = state.open_until {
            if open_until > now {
                return Admission::CircuitOpen(open_until - now);
            }
            state.open_until = None;
        }

        if state.window.len() >= self.config.rpm {
            let oldest = state.window.front().copied().unwrap_or(now);
            let wait = WINDOW.saturating_sub(now.saturating_duration_since(oldest));
            return Admission::WindowFull(wait.max(Duration::from_millis(1)));
        }

        state.window.push_back(now);
        Admission::Admitted
    }

    /// Block until a slot is available, then reserve it. Never rejects.
    pub fn acquire(&self) {
        loop {
            match self.try_admit() {
                Admission::Admitted => return,
                Admission::CircuitOpen(wait) => {
                    debug!(
                        provider = %self.provider,
                        wait_ms = wait.as_millis() as u64,
                        "circuit open, waiting"
                    );
                    self.clock.sleep(wait);
                }
                Admission::WindowFull(wait) => {
                    debug!(
                        provider = %self.provider,
                        wait_ms = wait.as_millis() as u64,
                        "rate window full, waiting"
                    );
                    self.clock.sleep(wait);
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock_state();
        state.failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut state = self.lock_state();
        state.failures += 1;
        if state.failures >= self.config.circuit_threshold {
            let cooldown = self.config.cooldown();
            state.open_until = Some(now + cooldown);
            state.failures = 0;
            warn!(
                provider = %self.provider,
                cooldown_secs = cooldown.as_secs(),
                "circuit breaker opened"
            );
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        let now = self.clock.now();
        self.lock_state().open_until.is_some_and(|until| until > now)
    }

    pub fn backoff(&self, attempt: u32) {
        self.clock.sleep(self.config.backoff_delay(attempt));
    }

    /// Run `op` under the limiter with up to `max_attempts` attempts.
    pub fn call_with_retry<T, F>(&self, mut op: F) -> CallOutcome<T>
    where
        F: FnMut() -> anyhow::Result<T>,
    {
        let mut last_error = None;
        let mut last_latency = Duration::ZERO;
        let max_attempts = self.config.max_attempts;

        for attempt in 1..=max_attempts {
            self.acquire();
            let started = self.clock.now();
            match op() {
                Ok(value) => {
                    self.record_success();
                    return CallOutcome {
                        value: Some(value),
                        latency: self.clock.now().saturating_duration_since(started),
                        attempts: attempt,
                        error: None,
                    };
                }
                Err(err) => {
                    last_latency = self.clock.now().saturating_duration_since(started);
                    self.record_failure();
                    warn!(
                        provider = %self.provider,
                        attempt,
                        max_attempts,
                        error = %format!("{err:#}"),
                        "external call failed"
                    );
                    last_error = Some(err);
                    if attempt < max_attempts {
                        self.backoff(attempt);
                    }
                }
            }
        }

        CallOutcome {
            value: None,
            latency: last_latency,
            attempts: max_attempts,
            error: last_error,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Clock whose `sleep` advances virtual time instantly.
    #[derive(Debug)]
    pub(crate) struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
        slept: Mutex<Vec<Duration>>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
                slept: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn elapsed(&self) -> Duration {
            *self.offset.lock().expect("offset")
        }

        pub(crate) fn advance(&self, by: Duration) {
            *self.offset.lock().expect("offset") += by;
        }

        pub(crate) fn sleeps(&self) -> Vec<Duration> {
            self.slept.lock().expect("slept").clone()
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + self.elapsed()
        }

        fn sleep(&self, duration: Duration) {
            self.slept.lock().expect("slept").push(duration);
            self.advance(duration);
        }
    }

    fn config(
        rpm: usize,
        max_attempts: u32,
        base_delay_secs: u64,
        threshold: u32,
    ) -> LimiterConfig {
        LimiterConfig {
            rpm,
            max_attempts,
            base_delay_secs,
            circuit_threshold: threshold,
        }
    }

    fn limiter(cfg: LimiterConfig) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock("test", cfg, clock.clone());
        (limiter, clock)
    }

    #[test]
    fn sixty_first_acquire_waits_for_the_window() {
        let (limiter, clock) = limiter(config(60, 1, 1, 5));
        for _ in 0..60 {
            limiter.acquire();
        }
        assert_eq!(clock.elapsed(), Duration::ZERO);

        limiter.acquire();
        assert!(clock.elapsed() >= Duration::from_secs(60));
    }

    #[test]
    fn window_slides_with_spaced_calls() {
        let (limiter, clock) = limiter(config(2, 1, 1, 5));
        limiter.acquire();
        clock.advance(Duration::from_secs(30));
        limiter.acquire();
        assert_eq!(limiter.try_admit(), Admission::WindowFull(Duration::from_secs(30)));

        limiter.acquire();
        assert_eq!(clock.elapsed(), Duration::from_secs(60));
    }

    #[test]
    fn circuit_opens_after_threshold_and_blocks_for_cooldown() {
        let (limiter, clock) = limiter(config(60, 1, 2, 3));
        limiter.record_failure();
        limiter.record_failure();
        assert!(!limiter.is_circuit_open());
        limiter.record_failure();
        assert!(limiter.is_circuit_open());

        limiter.acquire();
        assert!(clock.elapsed() >= Duration::from_secs(30));
        assert!(!limiter.is_circuit_open());
    }

    #[test]
    fn cooldown_scales_with_base_delay() {
        let cfg = config(60, 1, 10, 1).clamped();
        assert_eq!(cfg.cooldown(), Duration::from_secs(50));
        assert_eq!(config(60, 1, 1, 1).clamped().cooldown(), Duration::from_secs(30));
    }

    #[test]
    fn success_closes_open_circuit_immediately() {
        let (limiter, clock) = limiter(config(60, 1, 1, 1));
        limiter.record_failure();
        assert!(limiter.is_circuit_open());
        limiter.record_success();
        assert!(!limiter.is_circuit_open());
        limiter.acquire();
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn backoff_is_exponential_without_jitter() {
        let cfg = config(60, 4, 2, 5).clamped();
        assert_eq!(cfg.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(cfg.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(cfg.backoff_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn constructor_clamps_zero_settings() {
        let limiter = RateLimiter::new("zero", config(0, 0, 0, 0));
        assert_eq!(limiter.config(), config(1, 1, 1, 1));
    }

    #[test]
    fn retry_wrapper_backs_off_then_succeeds() {
        let (limiter, clock) = limiter(config(60, 3, 1, 10));
        let mut calls = 0;
        let outcome = limiter.call_with_retry(|| {
            calls += 1;
            if calls < 3 {
                anyhow::bail!("transient {calls}");
            }
            Ok("done")
        });

        assert_eq!(outcome.value, Some("done"));
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.error.is_none());
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[test]
    fn retry_wrapper_returns_failure_after_exhausting_attempts() {
        let (limiter, clock) = limiter(config(60, 2, 1, 10));
        let outcome: CallOutcome<()> = limiter.call_with_retry(|| anyhow::bail!("down"));

        assert!(outcome.value.is_none());
        assert_eq!(outcome.attempts, 2);
        let err = outcome.error.expect("last error kept");
        assert!(format!("{err}").contains("down"));
        // only one backoff between the two attempts
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }
}
