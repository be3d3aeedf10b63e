//! Mock clock for testing.

use crate::application::ports::Clock;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, Copy)]
struct MockTime {
    instant: Instant,
    wall: SystemTime,
}

/// Clock whose time only moves when a test says so.
///
/// Monotonic and wall-clock readings advance together, which keeps window
/// expiry, cache TTLs and monitoring timestamps consistent in a test.
///
/// # Examples
///
/// ```
/// use inference_gate::infrastructure::mocks::MockClock;
/// use inference_gate::application::ports::Clock;
/// use std::time::{Duration, Instant};
///
/// let start = Instant::now();
/// let clock = MockClock::new(start);
/// let wall = clock.wall_time();
///
/// clock.advance(Duration::from_secs(10));
/// assert_eq!(clock.now(), start + Duration::from_secs(10));
/// assert_eq!(clock.wall_time(), wall + Duration::from_secs(10));
/// ```
///
/// Clones share the same underlying time, so advancing one advances all.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<MockTime>>,
}

impl MockClock {
    /// Create a mock clock starting at a specific instant.
    ///
    /// Wall-clock time starts at the real current time.
    pub fn new(start: Instant) -> Self {
        Self::with_wall_time(start, SystemTime::now())
    }

    /// Create a mock clock with explicit monotonic and wall-clock origins.
    pub fn with_wall_time(start: Instant, wall: SystemTime) -> Self {
        Self {
            current: Arc::new(Mutex::new(MockTime {
                instant: start,
                wall,
            })),
        }
    }

    /// Advance both readings by a duration.
    pub fn advance(&self, duration: Duration) {
        let mut time = self
            .current
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock");
        time.instant += duration;
        time.wall += duration;
    }

    /// Set the monotonic reading to a specific instant.
    ///
    /// Wall-clock time moves by the same signed offset.
    pub fn set(&self, instant: Instant) {
        let mut time = self
            .current
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock");
        let current = time.instant;
        if instant >= current {
            time.wall += instant - current;
        } else {
            time.wall -= current - instant;
        }
        time.instant = instant;
    }

    fn read(&self) -> MockTime {
        *self
            .current
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock")
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.read().instant
    }

    fn wall_time(&self) -> SystemTime {
        self.read().wall
    }
}
