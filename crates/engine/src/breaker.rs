use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// What the breaker allows for the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Circuit closed; call normally.
    Allow,
    /// Cooldown elapsed; exactly one probe call.
    Probe,
    /// Circuit open; no wire call before `retry_in` has passed.
    ShortCircuit { retry_in: Duration },
}

/// Three-state breaker isolating the remote backend.
///
/// The failure counter counts calls that exhausted their retries, not
/// intermediate retries within a call.
#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: CircuitState,
    consecutive_failures: u32,
    next_attempt_at: Option<Instant>,
}

impl CircuitBreaker {
    pub(crate) fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            next_attempt_at: None,
        }
    }

    pub(crate) fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allow,
            CircuitState::HalfOpen => Admission::Probe,
            CircuitState::Open => {
                let next = self.next_attempt_at.unwrap_or(now);
                if now >= next {
                    self.state = CircuitState::HalfOpen;
                    Admission::Probe
                } else {
                    Admission::ShortCircuit {
                        retry_in: next.duration_since(now),
                    }
                }
            }
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.next_attempt_at = None;
    }

    pub(crate) fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::HalfOpen => self.reopen(now),
            _ => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.failure_threshold {
                    self.reopen(now);
                }
            }
        }
    }

    fn reopen(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.next_attempt_at = Some(now + self.cooldown);
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.state
    }

    /// Status note shown by `Status()`.
    pub(crate) fn describe(&self, now: Instant) -> String {
        match self.state {
            CircuitState::Closed => "circuit closed".to_string(),
            CircuitState::HalfOpen => "circuit half-open (probing)".to_string(),
            CircuitState::Open => {
                let retry_in = self
                    .next_attempt_at
                    .map(|t| t.saturating_duration_since(now).as_millis())
                    .unwrap_or(0);
                format!("circuit open (next probe in {retry_in} ms)")
            }
        }
    }
}
