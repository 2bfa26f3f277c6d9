//! Simulation time authority
//!
//! One tick is one unit of time. The counter is 64 bits wide and never wraps:
//! running past `u64::MAX` is reported as [`HarnessError::ClockOverflow`].

use crate::error::{HarnessError, HarnessResult};

/// Simulation time in ticks.
pub type SimTime = u64;

/// Monotonic tick counter owned by the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimClock {
    now: SimTime,
}

impl SimClock {
    pub fn new() -> Self {
        Self { now: 0 }
    }

    /// Clock that starts at an arbitrary time.
    pub fn starting_at(time: SimTime) -> Self {
        Self { now: time }
    }

    #[inline]
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Advance by exactly one tick and return the new time.
    #[inline]
    pub fn advance(&mut self) -> HarnessResult<SimTime> {
        self.now = self
            .now
            .checked_add(1)
            .ok_or(HarnessError::ClockOverflow(self.now))?;
        Ok(self.now)
    }
}
