use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::ClockError;

/// A simulated clock that never moves backward
#[derive(Debug)]
pub struct LogicalClock {
    time: Mutex<DateTime<Utc>>,
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::MIN_UTC)
    }
}

impl LogicalClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            time: Mutex::new(start),
        }
    }

    /// Current reading of the clock
    pub fn now(&self) -> DateTime<Utc> {
        *self.time.lock()
    }

    /// Move the clock forward to `target`.
    ///
    /// Returns the new time and how far the clock moved. Fails without
    /// touching the clock if `target` is earlier than the current time.
    pub fn increase_clock_time_to(
        &self,
        target: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, chrono::Duration), ClockError> {
        let mut time = self.time.lock();
        if target < *time {
            return Err(ClockError::Rewind {
                current: *time,
                requested: target,
            });
        }

        let diff = target - *time;
        *time = target;
        Ok((target, diff))
    }

    /// Advance the clock by exactly `amount`
    pub fn increment_clock_by(&self, amount: chrono::Duration) -> Result<DateTime<Utc>, ClockError> {
        if amount < chrono::Duration::zero() {
            return Err(ClockError::NegativeIncrement(amount));
        }

        let mut time = self.time.lock();
        let next = time
            .checked_add_signed(amount)
            .ok_or(ClockError::Overflow)?;
        *time = next;
        Ok(next)
    }
}
