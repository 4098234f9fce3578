//! Time source for TTL bookkeeping in [`MemoryBackend`](crate::MemoryBackend).
//!
//! ```
//! use std::time::Duration;
//! use trogon_dcron::clock::{Clock, ManualClock};
//!
//! let clock = ManualClock::new();
//! let deadline = clock.now() + Duration::from_secs(10);
//!
//! clock.advance(Duration::from_secs(9));
//! assert!(clock.now() < deadline);
//!
//! clock.advance(Duration::from_secs(1));
//! assert!(clock.now() >= deadline);
//! ```

use std::ops::Add;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub trait Clock: Send + Sync + Clone + 'static {
    type Instant: Copy + Ord + Add<Duration, Output = Self::Instant> + Send + Sync + std::fmt::Debug;

    fn now(&self) -> Self::Instant;
}

/// Zero-sized type, delegates to `std::time::Instant`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    type Instant = std::time::Instant;

    #[inline]
    fn now(&self) -> std::time::Instant {
        std::time::Instant::now()
    }
}

/// Time only moves when [`advance`](ManualClock::advance) or
/// [`set`](ManualClock::set) is called. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    current: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Starts at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }

    pub fn set(&self, to: Duration) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }

    pub fn elapsed(&self) -> Duration {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Offset from the [`ManualClock`] epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ManualInstant(pub Duration);

impl Add<Duration> for ManualInstant {
    type Output = ManualInstant;

    fn add(self, rhs: Duration) -> ManualInstant {
        ManualInstant(self.0 + rhs)
    }
}

impl Clock for ManualClock {
    type Instant = ManualInstant;

    fn now(&self) -> ManualInstant {
        ManualInstant(self.elapsed())
    }
}
