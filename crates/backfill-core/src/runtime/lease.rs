// crates/backfill-core/src/runtime/lease.rs
// ============================================================================
// Module: Backfill Worker Lease
// Description: In-memory lease provider and scoped lease guard.
// Purpose: Guarantee the worker lease is released on every exit path.
// Dependencies: crate::interfaces, crate::runtime::events
// ============================================================================

//! ## Overview
//! [`LeaseGuard`] owns an obtained lease and cancels it when dropped, so the
//! lease is released on early returns, errors, and panics inside the runner.
//! A failed release is logged as `lease_release_failed`; the lease then
//! expires on its own after its TTL.
//!
//! [`InMemoryLeaseProvider`] shares leases between clones in one process.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::core::Timestamp;
use crate::interfaces::Clock;
use crate::interfaces::LeaseError;
use crate::interfaces::LeaseProvider;
use crate::interfaces::LeaseToken;
use crate::runtime::events::EventScope;
use crate::runtime::events::MigrationEvent;
use crate::runtime::events::MigrationEventKind;
use crate::runtime::events::MigrationEventSink;

// ============================================================================
// SECTION: Lease Timeout
// ============================================================================

/// Returns `max(interval * multiplier, minimum)`.
#[must_use]
pub fn lease_timeout(interval: Duration, multiplier: u32, minimum: Duration) -> Duration {
    interval.saturating_mul(multiplier).max(minimum)
}

// ============================================================================
// SECTION: In-Memory Provider
// ============================================================================

/// Held lease entry.
#[derive(Debug, Clone)]
struct HeldLease {
    /// Owner token.
    token: LeaseToken,
    /// Instant after which the lease may be taken over.
    expires_at: Timestamp,
}

/// Process-local lease provider; clones share the same lease table.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLeaseProvider {
    /// Leases keyed by name.
    leases: Arc<Mutex<BTreeMap<String, HeldLease>>>,
}

impl InMemoryLeaseProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `key` is held by an unexpired lease at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError`] when the lease table lock is poisoned.
    pub fn is_held(&self, key: &str, now: Timestamp) -> Result<bool, LeaseError> {
        let leases = self.leases.lock().map_err(|_| poisoned())?;
        Ok(leases.get(key).is_some_and(|held| held.expires_at > now))
    }
}

/// Error returned when the lease table mutex is poisoned.
fn poisoned() -> LeaseError {
    LeaseError::Backend("lease table mutex poisoned".to_string())
}

impl LeaseProvider for InMemoryLeaseProvider {
    fn try_obtain(
        &self,
        key: &str,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<Option<LeaseToken>, LeaseError> {
        let mut leases = self.leases.lock().map_err(|_| poisoned())?;
        if leases.get(key).is_some_and(|held| held.expires_at > now) {
            return Ok(None);
        }
        let token = LeaseToken::generate();
        leases.insert(
            key.to_string(),
            HeldLease {
                token: token.clone(),
                expires_at: now.saturating_add(ttl),
            },
        );
        Ok(Some(token))
    }

    fn cancel(&self, key: &str, token: &LeaseToken) -> Result<bool, LeaseError> {
        let mut leases = self.leases.lock().map_err(|_| poisoned())?;
        if leases.get(key).is_some_and(|held| &held.token == token) {
            leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

// ============================================================================
// SECTION: Lease Guard
// ============================================================================

/// Scoped ownership of an obtained lease; releases it on drop.
pub struct LeaseGuard<'a, L: LeaseProvider> {
    /// Provider that issued the lease.
    provider: &'a L,
    /// Lease name.
    key: String,
    /// Owner token.
    token: LeaseToken,
    /// Sink for release failures.
    events: &'a dyn MigrationEventSink,
    /// Worker identity for release failure events.
    scope: &'a EventScope,
    /// Clock used to timestamp release failures.
    clock: &'a dyn Clock,
}

impl<'a, L: LeaseProvider> LeaseGuard<'a, L> {
    /// Tries to obtain `key` and wraps it in a guard.
    ///
    /// Returns `Ok(None)` when the lease is held elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError`] when the provider fails.
    pub fn obtain(
        provider: &'a L,
        key: &str,
        ttl: Duration,
        clock: &'a dyn Clock,
        events: &'a dyn MigrationEventSink,
        scope: &'a EventScope,
    ) -> Result<Option<Self>, LeaseError> {
        let Some(token) = provider.try_obtain(key, ttl, clock.now())? else {
            return Ok(None);
        };
        Ok(Some(Self {
            provider,
            key: key.to_string(),
            token,
            events,
            scope,
            clock,
        }))
    }

    /// Returns the lease name.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the owner token.
    #[must_use]
    pub const fn token(&self) -> &LeaseToken {
        &self.token
    }
}

impl<L: LeaseProvider> Drop for LeaseGuard<'_, L> {
    fn drop(&mut self) {
        let message = match self.provider.cancel(&self.key, &self.token) {
            Ok(true) => return,
            Ok(false) => format!("lease {} was no longer held by this worker", self.key),
            Err(err) => err.to_string(),
        };
        self.events.record(
            &MigrationEvent::new(MigrationEventKind::LeaseReleaseFailed, self.scope, self.clock.now())
                .with_message(message),
        );
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_timeout_has_a_floor() {
        let floor = Duration::from_secs(600);
        assert_eq!(lease_timeout(Duration::from_secs(300), 3, floor), Duration::from_secs(900));
        assert_eq!(lease_timeout(Duration::from_secs(120), 3, floor), floor);
        assert_eq!(lease_timeout(Duration::from_secs(120), 1, floor), floor);
    }

    #[test]
    fn expired_leases_can_be_taken_over() {
        let provider = InMemoryLeaseProvider::new();
        let start = Timestamp::from_unix_millis(0);
        let ttl = Duration::from_secs(10);
        let first = provider.try_obtain("worker", ttl, start).ok().flatten();
        assert!(first.is_some());
        assert_eq!(provider.try_obtain("worker", ttl, start).ok().flatten(), None);
        let later = start.saturating_add(ttl);
        let second = provider.try_obtain("worker", ttl, later).ok().flatten();
        assert!(second.is_some());
        assert_ne!(first, second);
    }

    #[test]
    fn cancel_requires_the_owner_token() {
        let provider = InMemoryLeaseProvider::new();
        let now = Timestamp::EPOCH;
        let Some(token) = provider.try_obtain("worker", Duration::from_secs(10), now).ok().flatten()
        else {
            return;
        };
        assert_eq!(provider.cancel("worker", &LeaseToken::new("stranger")), Ok(false));
        assert_eq!(provider.is_held("worker", now), Ok(true));
        assert_eq!(provider.cancel("worker", &token), Ok(true));
        assert_eq!(provider.is_held("worker", now), Ok(false));
    }
}
