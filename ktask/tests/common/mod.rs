// Copyright 2026 ktask Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared plumbing for the hosted end-to-end tests: a std-backed boot clock
//! and a bounded poll helper for conditions driven by another CPU's world.

use core::time::Duration;
use std::time::Instant as StdInstant;

use ktask::time::{self, Clock};

pub fn init_clock() {
    fn now() -> u64 {
        use std::sync::OnceLock;

        static ANCHOR: OnceLock<StdInstant> = OnceLock::new();
        ANCHOR.get_or_init(StdInstant::now).elapsed().as_nanos() as u64
    }

    time::init(Clock::new(Duration::from_nanos(1), now).named("test-monotonic"));
}

/// Polls `cond` from outside the scheduling world until it holds.
///
/// # Panics
///
/// Panics if `cond` is still false after ten seconds.
#[allow(dead_code)]
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = StdInstant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(StdInstant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
