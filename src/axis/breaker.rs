//! Per-gear circuit breaker.
//!
//! Failures are counted inside a sliding window; crossing the threshold
//! opens the circuit for a fixed interval, during which the plan executor
//! skips that gear's steps with `CIRCUIT_OPEN` instead of invoking it. A
//! success closes the circuit and clears the window. State is in-memory
//! only: after a restart every gear starts closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::config::BreakerConfig;

/// Failure-window state for one gear.
#[derive(Debug, Clone)]
struct CircuitState {
    failures: u32,
    window_start: DateTime<Utc>,
    open_until: Option<DateTime<Utc>>,
}

/// Per-gear circuit breaker.
pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, CircuitState>>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    /// Create a breaker with every circuit closed.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Record a step failure for a gear, possibly opening its circuit.
    pub fn record_failure(&self, gear: &str) {
        self.record_failure_at(gear, Utc::now());
    }

    fn record_failure_at(&self, gear: &str, now: DateTime<Utc>) {
        let mut circuits = match self.circuits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let window = Duration::seconds(self.config.window_secs);

        let state = circuits.entry(gear.to_owned()).or_insert(CircuitState {
            failures: 0,
            window_start: now,
            open_until: None,
        });

        if now.signed_duration_since(state.window_start) > window {
            state.failures = 0;
            state.window_start = now;
        }
        state.failures = state.failures.saturating_add(1);

        if state.failures >= self.config.failure_threshold && state.open_until.is_none() {
            let until = now
                .checked_add_signed(Duration::seconds(self.config.open_secs))
                .unwrap_or(now);
            state.open_until = Some(until);
            warn!(gear, failures = state.failures, "circuit opened");
        }
    }

    /// Record a step success: closes the circuit and clears the window.
    pub fn record_success(&self, gear: &str) {
        let mut circuits = match self.circuits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if circuits.remove(gear).is_some_and(|s| s.open_until.is_some()) {
            info!(gear, "circuit closed after success");
        }
    }

    /// Whether the gear's circuit is currently open.
    pub fn is_open(&self, gear: &str) -> bool {
        self.is_open_at(gear, Utc::now())
    }

    fn is_open_at(&self, gear: &str, now: DateTime<Utc>) -> bool {
        let circuits = match self.circuits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        circuits
            .get(gear)
            .and_then(|s| s.open_until)
            .is_some_and(|until| now < until)
    }

    /// Gears whose circuits are currently open.
    pub fn open_gears(&self) -> Vec<String> {
        let now = Utc::now();
        let circuits = match self.circuits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut open: Vec<String> = circuits
            .iter()
            .filter(|(_, s)| s.open_until.is_some_and(|until| now < until))
            .map(|(gear, _)| gear.clone())
            .collect();
        open.sort();
        open
    }

    /// A predicate closure for the plan executor's circuit check.
    pub fn predicate(self: &Arc<Self>) -> Arc<dyn Fn(&str) -> bool + Send + Sync> {
        let breaker = Arc::clone(self);
        Arc::new(move |gear| breaker.is_open(gear))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            window_secs: 60,
            open_secs: 30,
        })
    }

    #[test]
    fn test_closed_until_threshold() {
        let b = breaker();
        b.record_failure("email");
        b.record_failure("email");
        assert!(!b.is_open("email"));
        b.record_failure("email");
        assert!(b.is_open("email"));
    }

    #[test]
    fn test_gears_are_independent() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure("email");
        }
        assert!(b.is_open("email"));
        assert!(!b.is_open("calendar"));
        assert_eq!(b.open_gears(), vec!["email"]);
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let b = breaker();
        let start = Utc::now();
        b.record_failure_at("email", start);
        b.record_failure_at("email", start);
        // Third failure lands outside the window: count restarts at 1.
        let late = start + Duration::seconds(120);
        b.record_failure_at("email", late);
        assert!(!b.is_open_at("email", late));
    }

    #[test]
    fn test_open_interval_elapses() {
        let b = breaker();
        let start = Utc::now();
        for _ in 0..3 {
            b.record_failure_at("email", start);
        }
        assert!(b.is_open_at("email", start));
        assert!(!b.is_open_at("email", start + Duration::seconds(31)));
    }

    #[test]
    fn test_success_closes_and_clears() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure("email");
        }
        assert!(b.is_open("email"));
        b.record_success("email");
        assert!(!b.is_open("email"));
        // The window restarted too: two more failures stay closed.
        b.record_failure("email");
        b.record_failure("email");
        assert!(!b.is_open("email"));
    }

    #[test]
    fn test_predicate() {
        let b = Arc::new(breaker());
        let pred = b.predicate();
        assert!(!pred("email"));
        for _ in 0..3 {
            b.record_failure("email");
        }
        assert!(pred("email"));
    }
}
