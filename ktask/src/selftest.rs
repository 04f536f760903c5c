// Copyright 2026 ktask Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Multitasking self-test.
//!
//! Spawns a handful of tasks that each log and sleep a couple of times,
//! joins them all, and checks the bookkeeping afterwards. Run from a task
//! (boot flow or the `selftest` shell command); it blocks the caller while
//! the spawned tasks rotate through the scheduler.

use core::time::Duration;

use alloc::vec::Vec;

use crate::task::{TaskRef, TaskState};
use crate::{cpu, sched};

const ITERATIONS: usize = 2;
const NAP: Duration = Duration::from_millis(100);

/// Starts `n` tasks, waits for all of them, and verifies they ran.
pub fn multitasking(n: usize) -> crate::Result<()> {
    let tasks: Vec<TaskRef> = (0..n)
        .map(|i| TaskRef::new(format_args!("selftest/{i}")))
        .collect();

    for (i, task) in tasks.iter().enumerate() {
        if let Err(err) = task.start(selftest_task) {
            log::error!("selftest: could not start task {i}: {err}");
            for started in &tasks[..i] {
                started.wait();
            }
            return Err(err);
        }
    }

    for task in tasks.iter() {
        task.wait();
    }

    for task in tasks.iter() {
        assert_eq!(task.state(), TaskState::Exited);
        task.verify_stack();
        log::info!(
            "selftest: {} ran {:?} over {} switches",
            task.name(),
            task.runtime(),
            task.context_switches()
        );
    }

    log::info!("selftest: {n} tasks ran to completion");
    Ok(())
}

fn selftest_task() {
    for _ in 0..ITERATIONS {
        let task = TaskRef::current();
        log::info!(
            "hello from task {} ({}) on cpu {}",
            task.pid(),
            task.name(),
            cpu::current_cpu().id()
        );
        sched::sleep(NAP);
        if task.is_stopping() {
            break;
        }
    }
}
