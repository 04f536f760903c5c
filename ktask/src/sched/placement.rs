// Copyright 2026 ktask Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Work placement: choosing the run-queue a task joins.
//!
//! The policy is a cheap work-spreading heuristic. Candidates are the CPUs
//! that are both online and permitted by the task's affinity; among them the
//! queue with the smallest context-switch counter wins, ties going to the
//! lowest CPU index. The counter is monotonic and read lock-free, so this
//! costs nothing but a scan over the mask.
//!
//! A task that is being re-placed prefers to migrate: its own queue is
//! skipped while any other candidate exists, and chosen only as the
//! fallback. A fresh task has no current queue, so on a single-CPU system
//! it simply lands on the boot CPU.

use core::ptr;

use crate::cpu::{CpuMask, cpu_table};
use crate::sched::queue::RunQueue;

/// Chooses the destination queue for a task with the given `affinity`,
/// currently queued on `current` (if anywhere).
///
/// Returns `None` when no online CPU is permitted by the affinity mask.
pub(crate) fn select_task_queue(
    affinity: CpuMask,
    current: Option<&'static RunQueue>,
) -> Option<&'static RunQueue> {
    let mask = cpu_table().running_cpus() & affinity;

    let mut best: Option<&'static RunQueue> = None;
    for id in mask.iter() {
        let candidate = cpu_table().cpu(id).queue();

        if let Some(current) = current {
            if ptr::eq(candidate, current) {
                continue;
            }
        }

        best = match best {
            None => Some(candidate),
            Some(best)
                if best.switch_context_counter() > candidate.switch_context_counter() =>
            {
                Some(candidate)
            }
            keep => keep,
        };
    }

    // Nothing but the caller's own queue qualified: stay put.
    best.or_else(|| current.filter(|q| mask.contains(q.cpu_id())))
}
