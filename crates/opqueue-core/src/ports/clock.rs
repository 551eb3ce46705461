//! Clock port - time as an injectable dependency.
//!
//! Services stamp `queued_at`/`started_at`/... from a `Clock` so tests can pin
//! or step time instead of sleeping.
//!
//! # Implementations
//! - **SystemClock**: `Utc::now()` (production)
//! - **FixedClock**: set and advanced by hand (tests)

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of "now" for every timestamp the engine writes.
///
/// # Thread Safety
/// - `Send + Sync` so one clock can be shared by the services, the id
///   generator and every worker task.
pub trait Clock: Send + Sync {
    /// Current instant, in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that stays where it is put.
///
/// Interior mutability lets a test hold an `Arc<FixedClock>`, hand clones to
/// the services, and still move time afterwards. A poisoned lock is recovered
/// rather than propagated: the value is a plain timestamp.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Jump to `now`. Moving backwards is allowed.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}
