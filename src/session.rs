//! Live session records: lifetime, bound model and counters.

use crate::error::{LivescribeError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

/// Time source for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub transcription_count: u64,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired_at(now)
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

/// Thread-safe session table. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    clock: Arc<dyn Clock>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.lock().len())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update<T>(&self, id: &str, f: impl FnOnce(&mut Session) -> T) -> Result<T> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| LivescribeError::SessionNotFound { id: id.to_string() })?;
        Ok(f(session))
    }

    /// Create an active session bound to `model_id`, valid for `ttl_hours`.
    pub fn create(&self, model_id: &str, ttl_hours: i64) -> Result<Session> {
        let now = self.clock.now();
        let expires_at = expiry_after(now, ttl_hours)?;
        let session = Session {
            id: Uuid::new_v4().to_string(),
            model_id: model_id.to_string(),
            created_at: now,
            expires_at,
            is_active: true,
            transcription_count: 0,
        };
        self.lock().insert(session.id.clone(), session.clone());
        info!(session = %session.id, model = model_id, ttl_hours, "session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.lock().get(id).cloned()
    }

    /// Look up a session that has not expired.
    pub fn validate(&self, id: &str) -> Result<Session> {
        let now = self.clock.now();
        let session = self
            .get(id)
            .ok_or_else(|| LivescribeError::SessionNotFound { id: id.to_string() })?;
        if session.is_expired_at(now) {
            return Err(LivescribeError::SessionExpired { id: id.to_string() });
        }
        Ok(session)
    }

    /// Resume an unexpired session on `model_id`, reactivating it.
    pub fn attach(&self, id: &str, model_id: &str) -> Result<Session> {
        let now = self.clock.now();
        let session = self.update(id, |s| {
            if s.is_expired_at(now) {
                return Err(LivescribeError::SessionExpired { id: s.id.clone() });
            }
            s.model_id = model_id.to_string();
            s.is_active = true;
            Ok(s.clone())
        })??;
        debug!(session = id, model = model_id, "session attached");
        Ok(session)
    }

    pub fn set_model(&self, id: &str, model_id: &str) -> Result<()> {
        self.update(id, |s| s.model_id = model_id.to_string())
    }

    /// Active and not expired. Unknown ids are invalid.
    pub fn is_valid(&self, id: &str) -> bool {
        let now = self.clock.now();
        self.lock().get(id).is_some_and(|s| s.is_valid_at(now))
    }

    pub fn increment_transcription_count(&self, id: &str) -> Result<u64> {
        self.update(id, |s| {
            s.transcription_count += 1;
            s.transcription_count
        })
    }

    /// Set expiry to now + `hours`. Does not add to the remaining time.
    pub fn extend(&self, id: &str, hours: i64) -> Result<Session> {
        let expires_at = expiry_after(self.clock.now(), hours)?;
        let session = self.update(id, |s| {
            s.expires_at = expires_at;
            s.clone()
        })?;
        debug!(session = id, hours, "session extended");
        Ok(session)
    }

    pub fn deactivate(&self, id: &str) -> Result<()> {
        self.update(id, |s| s.is_active = false)?;
        debug!(session = id, "session deactivated");
        Ok(())
    }

    /// Reconcile active sessions with a model switch.
    ///
    /// Active sessions bound to another model are rebound to `model_id` when
    /// `keep` is set, deactivated otherwise. Returns how many were touched.
    pub fn retarget(&self, model_id: &str, keep: bool) -> usize {
        let mut touched = 0;
        for session in self.lock().values_mut() {
            if !session.is_active || session.model_id == model_id {
                continue;
            }
            if keep {
                session.model_id = model_id.to_string();
            } else {
                session.is_active = false;
            }
            touched += 1;
        }
        if touched > 0 {
            info!(model = model_id, keep, touched, "sessions retargeted");
        }
        touched
    }

    /// Active, unexpired sessions bound to `model_id`.
    pub fn active_count_for(&self, model_id: &str) -> usize {
        let now = self.clock.now();
        self.lock()
            .values()
            .filter(|s| s.model_id == model_id && s.is_valid_at(now))
            .count()
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn get_remaining_time(&self, id: &str) -> Result<Duration> {
        let now = self.clock.now();
        self.get(id)
            .map(|s| s.remaining_at(now))
            .ok_or_else(|| LivescribeError::SessionNotFound { id: id.to_string() })
    }

    /// Remove sessions that are both expired and inactive. Safe to call at
    /// any cadence; returns the number removed.
    pub fn delete_expired(&self) -> usize {
        let now = self.clock.now();
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.is_active || !s.is_expired_at(now));
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, "expired sessions swept");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// `now` plus `hours`; `InvalidTtl` unless positive and representable.
fn expiry_after(now: DateTime<Utc>, hours: i64) -> Result<DateTime<Utc>> {
    if hours <= 0 {
        return Err(LivescribeError::InvalidTtl { hours });
    }
    Duration::try_hours(hours)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or(LivescribeError::InvalidTtl { hours })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Clock that only moves when told to.
    pub(crate) struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Utc::now())))
        }

        pub(crate) fn advance(&self, by: Duration) {
            *self.0.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn registry() -> (SessionRegistry, Arc<ManualClock>) {
        let clock = ManualClock::new();
        (SessionRegistry::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_valid_until_clock_passes_expiry() {
        let (registry, clock) = registry();
        let session = registry.create("m", 1).unwrap();
        assert!(session.expires_at > session.created_at);
        assert!(registry.is_valid(&session.id));

        clock.advance(Duration::minutes(59));
        assert!(registry.is_valid(&session.id));

        clock.advance(Duration::minutes(2));
        assert!(!registry.is_valid(&session.id));
        assert!(matches!(
            registry.validate(&session.id),
            Err(LivescribeError::SessionExpired { .. })
        ));
    }

    #[test]
    fn test_create_rejects_non_positive_ttl() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.create("m", 0),
            Err(LivescribeError::InvalidTtl { hours: 0 })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let (registry, _) = registry();
        let a = registry.create("m", 1).unwrap();
        let b = registry.create("m", 1).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_deactivated_session_is_invalid() {
        let (registry, _) = registry();
        let session = registry.create("m", 1).unwrap();
        registry.deactivate(&session.id).unwrap();
        assert!(!registry.is_valid(&session.id));
        // Still retrievable while unexpired.
        assert!(registry.validate(&session.id).is_ok());
    }

    #[test]
    fn test_extend_overwrites_expiry() {
        let (registry, clock) = registry();
        let session = registry.create("m", 24).unwrap();
        clock.advance(Duration::hours(1));

        let extended = registry.extend(&session.id, 2).unwrap();
        assert_eq!(extended.expires_at, clock.now() + Duration::hours(2));
        assert!(extended.expires_at < session.expires_at);
        assert_eq!(
            registry.get_remaining_time(&session.id).unwrap(),
            Duration::hours(2)
        );
    }

    #[test]
    fn test_unrepresentable_lifetime_is_invalid_ttl() {
        let (registry, _) = registry();
        let session = registry.create("m", 1).unwrap();

        for hours in [10_000_000_000, i64::MAX] {
            assert!(matches!(
                registry.extend(&session.id, hours),
                Err(LivescribeError::InvalidTtl { hours: h }) if h == hours
            ));
            assert!(matches!(
                registry.create("m", hours),
                Err(LivescribeError::InvalidTtl { .. })
            ));
        }
        assert_eq!(registry.get(&session.id).unwrap().expires_at, session.expires_at);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_increment_counts_per_session() {
        let (registry, _) = registry();
        let a = registry.create("m", 1).unwrap();
        let b = registry.create("m", 1).unwrap();
        registry.increment_transcription_count(&a.id).unwrap();
        assert_eq!(registry.increment_transcription_count(&a.id).unwrap(), 2);
        assert_eq!(registry.get(&b.id).unwrap().transcription_count, 0);
        assert!(registry.increment_transcription_count("missing").is_err());
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let (registry, _) = registry();
        let session = registry.create("m", 1).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let id = session.id.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry.increment_transcription_count(&id).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.get(&session.id).unwrap().transcription_count, 800);
    }

    #[test]
    fn test_attach_reactivates_and_rebinds() {
        let (registry, _) = registry();
        let session = registry.create("a", 1).unwrap();
        registry.deactivate(&session.id).unwrap();

        let attached = registry.attach(&session.id, "b").unwrap();
        assert!(attached.is_active);
        assert_eq!(attached.model_id, "b");
    }

    #[test]
    fn test_attach_refuses_expired_session() {
        let (registry, clock) = registry();
        let session = registry.create("a", 1).unwrap();
        clock.advance(Duration::hours(2));
        assert!(matches!(
            registry.attach(&session.id, "a"),
            Err(LivescribeError::SessionExpired { .. })
        ));
        assert!(matches!(
            registry.attach("missing", "a"),
            Err(LivescribeError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn test_sweep_spares_active_sessions() {
        let (registry, clock) = registry();
        let active = registry.create("m", 1).unwrap();
        let idle = registry.create("m", 1).unwrap();
        let fresh = registry.create("m", 48).unwrap();
        registry.deactivate(&idle.id).unwrap();
        registry.deactivate(&fresh.id).unwrap();
        clock.advance(Duration::hours(2));

        assert_eq!(registry.delete_expired(), 1);
        assert_eq!(registry.delete_expired(), 0);
        assert!(registry.get(&active.id).is_some());
        assert!(registry.get(&idle.id).is_none());
        assert!(registry.get(&fresh.id).is_some());
    }

    #[test]
    fn test_retarget_after_switch() {
        let (registry, _) = registry();
        let a = registry.create("a", 1).unwrap();
        let b = registry.create("b", 1).unwrap();

        assert_eq!(registry.retarget("b", false), 1);
        assert!(!registry.get(&a.id).unwrap().is_active);
        assert!(registry.get(&b.id).unwrap().is_active);

        let c = registry.create("c", 1).unwrap();
        assert_eq!(registry.retarget("b", true), 1);
        let c = registry.get(&c.id).unwrap();
        assert!(c.is_active);
        assert_eq!(c.model_id, "b");
    }

    #[test]
    fn test_active_count_ignores_inactive_and_expired() {
        let (registry, clock) = registry();
        registry.create("m", 1).unwrap();
        let inactive = registry.create("m", 10).unwrap();
        registry.deactivate(&inactive.id).unwrap();
        registry.create("m", 10).unwrap();
        registry.create("other", 10).unwrap();

        assert_eq!(registry.active_count_for("m"), 2);
        clock.advance(Duration::hours(2));
        assert_eq!(registry.active_count_for("m"), 1);
    }

    #[test]
    fn test_list_is_oldest_first() {
        let (registry, clock) = registry();
        let first = registry.create("m", 1).unwrap();
        clock.advance(Duration::seconds(1));
        let second = registry.create("m", 1).unwrap();
        let ids: Vec<_> = registry.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[test]
    fn test_remaining_time_is_zero_after_expiry() {
        let (registry, clock) = registry();
        let session = registry.create("m", 1).unwrap();
        clock.advance(Duration::hours(3));
        assert_eq!(
            registry.get_remaining_time(&session.id).unwrap(),
            Duration::zero()
        );
    }
}
