//! IdGenerator port - document key generation.
//!
//! Keys are ULIDs: sortable by creation time and safe to generate on any node
//! without coordination.
//!
//! # Implementations
//! - **UlidGenerator**: timestamp from a `Clock`, 80 random bits

use ulid::Ulid;

use crate::ports::Clock;

/// Produces the `_id` for documents inserted without one.
///
/// # ULID properties
/// - Lexicographic order is creation order, to the millisecond.
/// - 128 bits, generated locally; two processes sharing a store never need
///   to agree on a counter.
///
/// # Thread Safety
/// - `Send + Sync`: a collection holds one generator behind an `Arc` and
///   calls it from whichever task inserts.
pub trait IdGenerator: Send + Sync {
    /// A fresh key. Never returns the same value twice in one process.
    fn generate(&self) -> Ulid;
}

/// ULID generator whose timestamp part comes from a `Clock`.
///
/// With a `FixedClock` every id shares one timestamp and differs only in its
/// random part, so tests get stable creation times without sleeping.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}
