//! Injectable time source.
//!
//! Window rotation and queue expiry are pure functions of "now", so the
//! components read time through a `Clock` handle instead of calling
//! `Utc::now()` directly. Production uses the system clock; tests use a
//! fixed clock that can be advanced deterministically.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct Clock {
    inner: Arc<Inner>,
}

#[derive(Debug)]
enum Inner {
    System,
    Fixed(Mutex<DateTime<Utc>>),
}

impl Clock {
    /// A clock that reads the real wall clock.
    pub fn system() -> Self {
        Self {
            inner: Arc::new(Inner::System),
        }
    }

    /// A clock frozen at `start`, movable only via [`Clock::advance`].
    pub fn fixed(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Inner::Fixed(Mutex::new(start))),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match &*self.inner {
            Inner::System => Utc::now(),
            Inner::Fixed(t) => *t.lock(),
        }
    }

    /// Advance a fixed clock. Has no effect on the system clock.
    pub fn advance(&self, delta: TimeDelta) {
        if let Inner::Fixed(t) = &*self.inner {
            let mut guard = t.lock();
            *guard = *guard + delta;
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances() {
        let start = Utc::now();
        let clock = Clock::fixed(start);
        assert_eq!(clock.now(), start);

        clock.advance(TimeDelta::seconds(61));
        assert_eq!(clock.now(), start + TimeDelta::seconds(61));
    }

    #[test]
    fn clones_share_the_same_time() {
        let clock = Clock::fixed(Utc::now());
        let other = clock.clone();
        clock.advance(TimeDelta::minutes(5));
        assert_eq!(clock.now(), other.now());
    }
}
