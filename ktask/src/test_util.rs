// Copyright 2026 ktask Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared helpers for the hosted unit tests.

use core::time::Duration;

use crate::time::{self, Clock};

/// A nanosecond-granularity clock backed by the host's monotonic clock.
pub(crate) fn std_clock() -> Clock {
    fn now() -> u64 {
        use std::sync::OnceLock;
        use std::time::Instant;

        static ANCHOR: OnceLock<Instant> = OnceLock::new();
        ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }

    Clock::new(Duration::from_nanos(1), now).named("std-monotonic")
}

/// Installs the std-backed clock; call freely, the first caller wins.
pub(crate) fn init_clock() {
    time::init(std_clock());
}
