// Copyright 2026 ktask Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler.
//!
//! [`schedule`] is the one suspension point in the system: tasks reach it by
//! yielding, by [`sleep`]ing, by exiting, or via [`tick`] when the embedding
//! kernel's timer interrupt fires with preemption enabled. Each call picks
//! the next runnable task off the current CPU's queue and swaps register
//! state with interrupts disabled; the outgoing task's accounting (runtime,
//! switch count, `Running → Waiting`) happens on the way out.
//!
//! An exited task cannot free itself while the CPU still runs on its stack,
//! so the switch that carries it away parks its last scheduler-held
//! reference in the CPU's reaper slot; the slot's previous occupant is
//! dropped at that moment, which is provably after that occupant's own final
//! switch completed.

pub(crate) mod placement;
pub mod queue;

use core::time::Duration;

use crate::cpu::{self, Cpu, cpu_table};
use crate::task::{Task, TaskState};
use crate::time::Instant;
use crate::arch;

/// Yields the current CPU to the next runnable task, if any.
///
/// Returns (eventually) when the calling task is scheduled again. With an
/// empty queue the call is a no-op and the caller keeps running. Task
/// context only.
pub fn schedule() {
    let curr = Task::current_raw();
    let cpu = cpu_table().cpu(curr.cpu());

    // Context switches only happen when preemption is allowed.
    if cpu.preempt_count() > 0 {
        return;
    }

    let _irq = arch::disable_interrupts();

    // Pick the next runnable task. The caller itself may still hold queue
    // membership (a CPU's bootstrap task runs without ever having been
    // picked); popping it here and falling through to the ordinary requeue
    // below resolves that into the running-task convention.
    let next = loop {
        match cpu.queue().pick_next() {
            Some(task) if task.ptr_eq_task(curr) => drop(task),
            other => break other,
        }
    };

    let Some(next) = next else {
        assert!(
            curr.state() != TaskState::Exited,
            "cpu {}: no runnable task to succeed an exited task",
            cpu.id()
        );
        return;
    };

    let now = Instant::now();
    curr.note_descheduled(now);

    let outgoing = cpu.take_current().expect("cpu lost its current task");
    debug_assert!(outgoing.ptr_eq_task(curr));
    if curr.state() == TaskState::Exited {
        cpu.park_exited(outgoing);
    } else {
        cpu.queue().insert(outgoing);
    }

    next.note_scheduled_in(now, cpu.id());
    let next_rsp = next.rsp_value();
    let curr_rsp_ptr = curr.rsp_ptr();
    cpu.set_current(next);

    // Safety: `next_rsp` was saved by a switch away from `next` (or built by
    // `init_frame`), and `curr_rsp_ptr` points into `curr`, which stays
    // alive on its queue or in the reaper slot until resumed or reaped.
    unsafe { arch::switch_context(curr_rsp_ptr, next_rsp) };

    // Somebody switched back to us; we are the current task again.
}

/// Timer-interrupt entry point: reschedules if the current CPU allows
/// preemption. The embedding kernel calls this from its timer handler.
pub fn tick() {
    let cpu = cpu::current_cpu();
    if cpu.preempt_count() == 0 {
        schedule();
    }
}

/// Gives up the CPU once; the caller is requeued at the tail.
pub fn yield_now() {
    schedule();
}

/// Yields until at least `duration` has elapsed on the boot clock.
pub fn sleep(duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        schedule();
        arch::spin_hint();
    }
}

/// Holds off preemption on the current CPU until dropped. Nests.
#[must_use]
pub struct PreemptGuard {
    cpu: &'static Cpu,
}

/// Disables timer-driven rescheduling on the calling task's CPU. Voluntary
/// [`schedule`] calls are held off as well until the guard drops.
pub fn preempt_disable() -> PreemptGuard {
    let cpu = cpu::current_cpu();
    cpu.preempt_disable();
    PreemptGuard { cpu }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        self.cpu.preempt_enable();
    }
}
