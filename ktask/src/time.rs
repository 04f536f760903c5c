// Copyright 2026 ktask Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The monotonic boot clock.
//!
//! The embedding kernel installs a [`Clock`] once during early boot
//! ([`init`]); everything in this crate measures time through it. Task
//! timestamps are kept in raw ticks and only widened to [`Duration`] at the
//! edges (diagnostics, `ps`).

use core::fmt;
use core::ops::{Add, Sub};
use core::time::Duration;

use spin::Once;

const NANOS_PER_SEC: u64 = 1_000_000_000;

static CLOCK: Once<Clock> = Once::new();

/// Installs the boot clock. The first call wins; later calls are ignored.
pub fn init(clock: Clock) {
    CLOCK.call_once(|| clock);
}

/// Returns the installed boot clock.
///
/// # Panics
///
/// Panics if [`init`] has not run yet.
pub fn clock() -> &'static Clock {
    CLOCK
        .get()
        .expect("boot clock not installed, call time::init first")
}

/// A named, monotonic tick source.
pub struct Clock {
    now: fn() -> u64,
    tick_duration: Duration,
    name: &'static str,
}

impl Clock {
    #[must_use]
    pub const fn new(tick_duration: Duration, now: fn() -> u64) -> Self {
        Self {
            now,
            tick_duration,
            name: "<unnamed clock>",
        }
    }

    #[must_use]
    pub const fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the [`Duration`] of one tick.
    #[must_use]
    pub const fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    #[inline]
    pub fn now_ticks(&self) -> u64 {
        (self.now)()
    }

    pub(crate) fn ticks_to_duration(&self, ticks: u64) -> Duration {
        // Split to avoid overflowing the nanosecond multiply for large tick
        // counts.
        let nanos_per_tick = self.tick_duration.as_nanos() as u64;
        let total_nanos = u128::from(ticks) * u128::from(nanos_per_tick);
        Duration::new(
            (total_nanos / u128::from(NANOS_PER_SEC)) as u64,
            (total_nanos % u128::from(NANOS_PER_SEC)) as u32,
        )
    }

    pub(crate) fn duration_to_ticks(&self, duration: Duration) -> u64 {
        let nanos_per_tick = self.tick_duration.as_nanos().max(1);
        (duration.as_nanos() / nanos_per_tick) as u64
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("name", &self.name)
            .field("tick_duration", &self.tick_duration)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {:?} precision", self.name, self.tick_duration)
    }
}

/// A measurement of the boot clock. Opaque and useful only with [`Duration`].
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(u64);

impl Instant {
    /// The clock's origin, i.e. boot.
    pub const ZERO: Self = Self(0);

    /// Returns an instant corresponding to "now".
    #[must_use]
    pub fn now() -> Self {
        Self(clock().now_ticks())
    }

    pub(crate) const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    pub(crate) const fn ticks(self) -> u64 {
        self.0
    }

    /// Returns the amount of time elapsed from `earlier` to `self`, or zero
    /// if `earlier` is later.
    #[must_use]
    pub fn duration_since(&self, earlier: Self) -> Duration {
        clock().ticks_to_duration(self.0.saturating_sub(earlier.0))
    }

    /// Returns the amount of time elapsed since this instant.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Self::now().duration_since(*self)
    }

    /// Returns `self + duration`, or `None` on tick overflow.
    #[must_use]
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        self.0
            .checked_add(clock().duration_to_ticks(duration))
            .map(Self)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    /// # Panics
    ///
    /// Panics if the result is not representable in clock ticks.
    fn add(self, other: Duration) -> Instant {
        self.checked_add(other)
            .expect("overflow when adding duration to instant")
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, other: Instant) -> Duration {
        self.duration_since(other)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instant({} ticks)", self.0)
    }
}
