//! Keyed throttle engine.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::decision::Decision;
use super::key::{counter_key, lockout_key, ThrottleKey};
use super::policy::{PolicyTable, ThrottleRule};
use super::store::{CounterRecord, CounterStore};
use crate::clock::seconds_until;
use crate::error::{EngineError, StoreError};

/// Default bound on a single counter store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Decides allow/deny for (action, key) pairs against a shared counter store.
///
/// The engine holds no locks of its own; all shared state lives in the store.
pub struct ThrottleEngine {
    policies: Arc<PolicyTable>,
    store: Arc<dyn CounterStore>,
    store_timeout: Duration,
}

impl ThrottleEngine {
    /// Create an engine with the default store timeout.
    pub fn new(policies: Arc<PolicyTable>, store: Arc<dyn CounterStore>) -> Self {
        Self {
            policies,
            store,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Override the bound on each store call.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// The policy table this engine enforces.
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Record an attempt for `key` under `action` and decide whether it may proceed.
    ///
    /// An active lockout is honored before the attempt is counted, so a locked
    /// key stays denied for the whole lockout even after its attempt window
    /// has rolled over. `now` is the only time source: window start, window
    /// reset and retry-after are all computed from it.
    pub async fn check(
        &self,
        action: &str,
        key: &ThrottleKey,
        now: DateTime<Utc>,
    ) -> Result<Decision, EngineError> {
        let rule = self.policies.get_rule(action)?;
        let storage_key = counter_key(action, key);

        trace!(
            action = %action,
            key = %key,
            "Checking throttle"
        );

        if let Some(decision) = self.active_lockout(rule, key, now).await? {
            debug!(
                action = %action,
                key = %key,
                retry_after = decision.retry_after_seconds,
                "Key is locked out"
            );
            return Ok(decision);
        }

        let record = self
            .bounded(self.store.increment(&storage_key, rule.window_seconds, now))
            .await?;

        if record.count <= u64::from(rule.max_attempts) {
            let remaining = u64::from(rule.max_attempts) - record.count;
            return Ok(Decision::within_limit(remaining as u32));
        }

        // The attempt is over the limit whether or not the lockout gets recorded.
        let decision = match rule.lockout() {
            Some(lockout_seconds) => {
                let lockout = self
                    .bounded(self.store.set(&lockout_key(action, key), 1, lockout_seconds, now))
                    .await;
                if let Err(e) = lockout {
                    warn!(
                        action = %action,
                        key = %key,
                        error = %e,
                        "Failed to record lockout"
                    );
                }
                Decision::locked_out(lockout_seconds)
            }
            None => Decision::limit_exceeded(seconds_until(record.expires_at, now)),
        };

        debug!(
            action = %action,
            key = %key,
            count = record.count,
            limit = rule.max_attempts,
            reason = ?decision.reason,
            retry_after = decision.retry_after_seconds,
            "Throttle limit exceeded"
        );

        Ok(decision)
    }

    /// Report whether the next attempt for `key` would be allowed, without
    /// counting one.
    pub async fn status(
        &self,
        action: &str,
        key: &ThrottleKey,
        now: DateTime<Utc>,
    ) -> Result<Decision, EngineError> {
        let rule = self.policies.get_rule(action)?;

        if let Some(decision) = self.active_lockout(rule, key, now).await? {
            return Ok(decision);
        }

        let record = self
            .bounded(self.store.get(&counter_key(action, key), now))
            .await?;

        Ok(match record {
            Some(CounterRecord { count, expires_at }) if count >= u64::from(rule.max_attempts) => {
                Decision::limit_exceeded(seconds_until(expires_at, now))
            }
            Some(CounterRecord { count, .. }) => {
                Decision::within_limit((u64::from(rule.max_attempts) - count) as u32)
            }
            None => Decision::within_limit(rule.max_attempts),
        })
    }

    /// Forget all attempts and any lockout for `key`, e.g. after a successful login.
    pub async fn reset(&self, action: &str, key: &ThrottleKey) -> Result<(), EngineError> {
        self.policies.get_rule(action)?;

        self.bounded(self.store.delete(&counter_key(action, key)))
            .await?;
        self.bounded(self.store.delete(&lockout_key(action, key)))
            .await?;

        debug!(action = %action, key = %key, "Throttle state reset");
        Ok(())
    }

    async fn active_lockout(
        &self,
        rule: &ThrottleRule,
        key: &ThrottleKey,
        now: DateTime<Utc>,
    ) -> Result<Option<Decision>, StoreError> {
        if rule.lockout().is_none() {
            return Ok(None);
        }

        let record = self
            .bounded(self.store.get(&lockout_key(&rule.action, key), now))
            .await?;

        Ok(record
            .filter(|r| r.expires_at > now)
            .map(|r| Decision::locked_out(seconds_until(r.expires_at, now))))
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::throttle::decision::DecisionReason;
    use crate::throttle::memory::MemoryCounterStore;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct Fixture {
        clock: Arc<ManualClock>,
        engine: ThrottleEngine,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 9, 1, 8, 0, 0).unwrap(),
        ));
        let policies = PolicyTable::new()
            .with_rule(ThrottleRule::new("login", 5, 900))
            .and_then(|t| t.with_rule(ThrottleRule::new("register", 5, 3600).with_lockout(3600)))
            .and_then(|t| t.with_rule(ThrottleRule::new("twoFactor", 3, 60).with_lockout(600)))
            .unwrap();
        let engine = ThrottleEngine::new(Arc::new(policies), Arc::new(MemoryCounterStore::new()));
        Fixture { clock, engine }
    }

    fn key(raw: &str) -> ThrottleKey {
        ThrottleKey::new(raw).unwrap()
    }

    #[tokio::test]
    async fn test_login_scenario() {
        let f = fixture();
        let k = key("a@x.com:127.0.0.1");

        for (i, expected_remaining) in [4, 3, 2, 1, 0].into_iter().enumerate() {
            if i > 0 {
                f.clock.advance_secs(2);
            }
            let d = f.engine.check("login", &k, f.clock.now()).await.unwrap();
            assert!(d.allowed, "attempt {} should be allowed", i + 1);
            assert_eq!(d.remaining_attempts, expected_remaining);
            assert_eq!(d.reason, DecisionReason::WithinLimit);
        }

        // Sixth attempt at t0+20s
        f.clock.advance_secs(12);
        let d = f.engine.check("login", &k, f.clock.now()).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.reason, DecisionReason::LimitExceeded);
        assert_eq!(d.retry_after_seconds, 880);
        assert_eq!(d.remaining_attempts, 0);
    }

    #[tokio::test]
    async fn test_register_lockout_scenario() {
        let f = fixture();
        let k = key("203.0.113.5");

        for _ in 0..5 {
            assert!(f.engine.check("register", &k, f.clock.now()).await.unwrap().allowed);
        }

        let d = f.engine.check("register", &k, f.clock.now()).await.unwrap();
        assert_eq!(d.reason, DecisionReason::LockedOut);
        assert_eq!(d.retry_after_seconds, 3600);

        f.clock.advance_secs(5);
        let d = f.engine.check("register", &k, f.clock.now()).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.reason, DecisionReason::LockedOut);
        assert_eq!(d.retry_after_seconds, 3595);
    }

    #[tokio::test]
    async fn test_denial_is_monotonic_within_window() {
        let f = fixture();
        let k = key("b@x.com:10.0.0.1");

        for _ in 0..5 {
            f.engine.check("login", &k, f.clock.now()).await.unwrap();
        }
        // Stays inside the 900s window the whole time.
        for _ in 0..20 {
            f.clock.advance_secs(30);
            let d = f.engine.check("login", &k, f.clock.now()).await.unwrap();
            assert!(!d.allowed);
            assert_eq!(d.reason, DecisionReason::LimitExceeded);
        }
    }

    #[tokio::test]
    async fn test_window_reset_starts_fresh_count() {
        let f = fixture();
        let k = key("c@x.com:10.0.0.2");

        for _ in 0..6 {
            f.engine.check("login", &k, f.clock.now()).await.unwrap();
        }
        f.clock.advance_secs(900);

        let d = f.engine.check("login", &k, f.clock.now()).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining_attempts, 4);
    }

    #[tokio::test]
    async fn test_keys_and_actions_are_independent() {
        let f = fixture();
        let k1 = key("10.0.0.1");
        let k2 = key("10.0.0.2");

        for _ in 0..6 {
            f.engine.check("login", &k1, f.clock.now()).await.unwrap();
        }
        assert!(!f.engine.check("login", &k1, f.clock.now()).await.unwrap().allowed);

        let d = f.engine.check("login", &k2, f.clock.now()).await.unwrap();
        assert_eq!(d.remaining_attempts, 4);

        let d = f.engine.check("register", &k1, f.clock.now()).await.unwrap();
        assert_eq!(d.remaining_attempts, 4);
    }

    #[tokio::test]
    async fn test_lockout_outlives_window() {
        let f = fixture();
        let k = key("user-42");

        for _ in 0..4 {
            f.engine.check("twoFactor", &k, f.clock.now()).await.unwrap();
        }

        // Window is 60s, lockout is 600s.
        f.clock.advance_secs(120);
        let d = f.engine.check("twoFactor", &k, f.clock.now()).await.unwrap();
        assert_eq!(d.reason, DecisionReason::LockedOut);
        assert_eq!(d.retry_after_seconds, 480);

        f.clock.advance_secs(480);
        let d = f.engine.check("twoFactor", &k, f.clock.now()).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining_attempts, 2);
    }

    #[tokio::test]
    async fn test_status_does_not_consume() {
        let f = fixture();
        let k = key("d@x.com:10.0.0.3");

        let d = f.engine.status("login", &k, f.clock.now()).await.unwrap();
        assert_eq!(d.remaining_attempts, 5);

        f.engine.check("login", &k, f.clock.now()).await.unwrap();
        for _ in 0..3 {
            let d = f.engine.status("login", &k, f.clock.now()).await.unwrap();
            assert_eq!(d.remaining_attempts, 4);
        }

        for _ in 0..4 {
            f.engine.check("login", &k, f.clock.now()).await.unwrap();
        }
        let d = f.engine.status("login", &k, f.clock.now()).await.unwrap();
        assert_eq!(d.reason, DecisionReason::LimitExceeded);
        assert_eq!(d.retry_after_seconds, 900);
    }

    #[tokio::test]
    async fn test_reset_clears_lockout() {
        let f = fixture();
        let k = key("198.51.100.7");

        for _ in 0..6 {
            f.engine.check("register", &k, f.clock.now()).await.unwrap();
        }
        let d = f.engine.status("register", &k, f.clock.now()).await.unwrap();
        assert_eq!(d.reason, DecisionReason::LockedOut);

        f.engine.reset("register", &k).await.unwrap();
        let d = f.engine.check("register", &k, f.clock.now()).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining_attempts, 4);
    }

    #[tokio::test]
    async fn test_unknown_action_is_config_error() {
        let f = fixture();
        let result = f.engine.check("checkout", &key("x"), f.clock.now()).await;
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment(&self, _: &str, _: u64, _: DateTime<Utc>) -> Result<CounterRecord, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn get(&self, _: &str, _: DateTime<Utc>) -> Result<Option<CounterRecord>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn set(&self, _: &str, _: u64, _: u64, _: DateTime<Utc>) -> Result<CounterRecord, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    struct SlowStore(MemoryCounterStore);

    #[async_trait]
    impl CounterStore for SlowStore {
        async fn increment(&self, key: &str, window: u64, now: DateTime<Utc>) -> Result<CounterRecord, StoreError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.0.increment(key, window, now).await
        }
        async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterRecord>, StoreError> {
            self.0.get(key, now).await
        }
        async fn set(&self, key: &str, value: u64, ttl: u64, now: DateTime<Utc>) -> Result<CounterRecord, StoreError> {
            self.0.set(key, value, ttl, now).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key).await
        }
    }

    /// Counts and reads work; lockout writes always fail.
    struct NoLockoutWrites(MemoryCounterStore);

    #[async_trait]
    impl CounterStore for NoLockoutWrites {
        async fn increment(&self, key: &str, window: u64, now: DateTime<Utc>) -> Result<CounterRecord, StoreError> {
            self.0.increment(key, window, now).await
        }
        async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CounterRecord>, StoreError> {
            self.0.get(key, now).await
        }
        async fn set(&self, _: &str, _: u64, _: u64, _: DateTime<Utc>) -> Result<CounterRecord, StoreError> {
            Err(StoreError::Unavailable("READONLY replica".to_string()))
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let engine = ThrottleEngine::new(Arc::new(PolicyTable::defaults()), Arc::new(DownStore));
        let result = engine.check("login", &key("x"), Utc::now()).await;
        assert!(matches!(
            result,
            Err(EngineError::StoreUnavailable(StoreError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_store_timeout_is_reported() {
        let store = SlowStore(MemoryCounterStore::new());
        let engine = ThrottleEngine::new(Arc::new(PolicyTable::defaults()), Arc::new(store))
            .with_store_timeout(Duration::from_millis(20));

        let result = engine.check("login", &key("x"), Utc::now()).await;
        assert!(matches!(
            result,
            Err(EngineError::StoreUnavailable(StoreError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn test_window_follows_caller_time() {
        let f = fixture();
        let k = key("e@x.com:10.0.0.4");
        let t0 = f.clock.now();
        let at = |secs: i64| t0 + chrono::TimeDelta::seconds(secs);

        // The manual clock is never advanced; only the `now` argument moves.
        for i in 0..5 {
            assert!(f.engine.check("login", &k, at(2 * i)).await.unwrap().allowed);
        }
        let d = f.engine.check("login", &k, at(20)).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.retry_after_seconds, 880);

        let d = f.engine.check("login", &k, at(1000)).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining_attempts, 4);

        let d = f.engine.status("login", &k, at(1000)).await.unwrap();
        assert_eq!(d.remaining_attempts, 4);
    }

    #[tokio::test]
    async fn test_failed_lockout_write_still_denies() {
        let policies = PolicyTable::new()
            .with_rule(ThrottleRule::new("register", 2, 3600).with_lockout(3600))
            .unwrap();
        let engine = ThrottleEngine::new(
            Arc::new(policies),
            Arc::new(NoLockoutWrites(MemoryCounterStore::new())),
        );
        let k = key("203.0.113.9");
        let now = Utc.with_ymd_and_hms(2024, 9, 1, 8, 0, 0).unwrap();

        assert!(engine.check("register", &k, now).await.unwrap().allowed);
        assert!(engine.check("register", &k, now).await.unwrap().allowed);

        for _ in 0..8 {
            let d = engine.check("register", &k, now).await.unwrap();
            assert!(!d.allowed);
            assert_eq!(d.reason, DecisionReason::LockedOut);
            assert_eq!(d.retry_after_seconds, 3600);
        }
    }
}
