//! Per-relay failure tracking with exponential cooldown.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use tokio::time::Instant;

/// Cooldown after the first failure in a streak.
pub const BASE_COOLDOWN: Duration = Duration::from_secs(5);
/// Upper bound on any cooldown.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(120);

/// Snapshot of one relay's backoff state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub url: String,
    /// Consecutive failures; zero after any success.
    pub failure_count: u32,
    /// While in the future the relay is skipped.
    pub cooldown_until: Option<Instant>,
}

#[derive(Debug, Default, Clone, Copy)]
struct RelayState {
    failures: u32,
    cooldown_until: Option<Instant>,
}

/// Tracks failure streaks and cooldowns for every relay a client talks to.
///
/// Updates happen under one lock so concurrent failures against the same
/// relay are all counted.
#[derive(Debug, Default)]
pub struct RelayBackoff {
    relays: Mutex<HashMap<String, RelayState>>,
}

impl RelayBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RelayState>> {
        // State stays consistent even if a holder panicked mid-update.
        self.relays.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True while the relay's cooldown expiry lies in the future.
    pub fn is_on_cooldown(&self, relay: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .get(relay)
            .and_then(|s| s.cooldown_until)
            .map_or(false, |until| until > now)
    }

    /// Extend the failure streak and start a fresh cooldown. Returns the
    /// cooldown applied.
    pub fn record_failure(&self, relay: &str) -> Duration {
        let mut relays = self.lock();
        let state = relays.entry(relay.to_string()).or_default();
        state.failures = state.failures.saturating_add(1);
        let delay = cooldown_for(state.failures);
        state.cooldown_until = Some(Instant::now() + delay);
        tracing::warn!(
            relay,
            failures = state.failures,
            cooldown_secs = delay.as_secs(),
            "relay on cooldown after failure"
        );
        delay
    }

    /// One success fully heals a relay: streak reset, cooldown cleared.
    pub fn record_success(&self, relay: &str) {
        let mut relays = self.lock();
        if let Some(state) = relays.get_mut(relay) {
            if state.failures > 0 {
                tracing::debug!(relay, "relay recovered");
            }
            *state = RelayState::default();
        }
    }

    /// Current state for `relay`.
    pub fn snapshot(&self, relay: &str) -> RelayTarget {
        let state = self.lock().get(relay).copied().unwrap_or_default();
        RelayTarget {
            url: relay.to_string(),
            failure_count: state.failures,
            cooldown_until: state.cooldown_until,
        }
    }
}

/// `min(120s, 5s * 2^(streak-1))`.
pub fn cooldown_for(streak: u32) -> Duration {
    if streak == 0 {
        return Duration::ZERO;
    }
    let factor = 1u64.checked_shl(streak - 1).unwrap_or(u64::MAX);
    let secs = BASE_COOLDOWN.as_secs().saturating_mul(factor);
    Duration::from_secs(secs).min(MAX_COOLDOWN)
}

#[cfg(test)]
mod tests {
    use super::*;

    const R: &str = "wss://relay.example";

    #[test]
    fn cooldown_schedule() {
        let expected = [5, 10, 20, 40, 80, 120, 120];
        for (i, secs) in expected.iter().enumerate() {
            assert_eq!(cooldown_for(i as u32 + 1), Duration::from_secs(*secs));
        }
        assert_eq!(cooldown_for(200), MAX_COOLDOWN);
        assert_eq!(cooldown_for(0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_grow_cooldown_from_now() {
        let backoff = RelayBackoff::new();
        for n in 1..=7u32 {
            let before = Instant::now();
            let delay = backoff.record_failure(R);
            assert_eq!(delay, cooldown_for(n));
            let snap = backoff.snapshot(R);
            assert_eq!(snap.failure_count, n);
            assert_eq!(snap.cooldown_until, Some(before + delay));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_expires() {
        let backoff = RelayBackoff::new();
        backoff.record_failure(R);
        assert!(backoff.is_on_cooldown(R));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(backoff.is_on_cooldown(R));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!backoff.is_on_cooldown(R));
        // Streak survives expiry: the next failure doubles.
        assert_eq!(backoff.record_failure(R), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn success_heals_immediately() {
        let backoff = RelayBackoff::new();
        for _ in 0..10 {
            backoff.record_failure(R);
        }
        assert!(backoff.is_on_cooldown(R));
        backoff.record_success(R);
        assert!(!backoff.is_on_cooldown(R));
        let snap = backoff.snapshot(R);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.cooldown_until, None);
        assert_eq!(backoff.record_failure(R), BASE_COOLDOWN);
    }

    #[test]
    fn unknown_relay_is_healthy() {
        let backoff = RelayBackoff::new();
        assert!(!backoff.is_on_cooldown("ws://other"));
        assert_eq!(backoff.snapshot("ws://other").failure_count, 0);
    }

    #[test]
    fn concurrent_failures_are_all_counted() {
        let backoff = std::sync::Arc::new(RelayBackoff::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = backoff.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        b.record_failure(R);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(backoff.snapshot(R).failure_count, 200);
    }
}
