// Copyright 2026 ktask Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-CPU run-queues.
//!
//! A run-queue holds the runnable tasks of one CPU in FIFO order: tasks are
//! inserted at the tail and picked from the head, so N runnable tasks share
//! their CPU in rotation. Membership and the task's back-reference change
//! together under the queue lock, which keeps "a task is on at most one
//! queue" checkable at any time and doubles as the publishing barrier for
//! frames built on another CPU.
//!
//! Any CPU may insert; only the owning CPU's scheduler picks. That asymmetry
//! is what makes it safe to complete a context switch after dropping the
//! lock: nobody else can resume a task this CPU just queued until this CPU
//! finishes switching away from it.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::collections::VecDeque;

use spin::Mutex;

use crate::cpu::CpuId;
use crate::task::{Task, TaskRef};

pub struct RunQueue {
    pub(crate) cpu: CpuId,
    tasks: Mutex<VecDeque<TaskRef>>,
    /// Bumped on every pick; placement reads it lock-free as a pressure
    /// gradient.
    switch_contexts: AtomicU64,
}

impl RunQueue {
    pub(crate) const fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            tasks: Mutex::new(VecDeque::new()),
            switch_contexts: AtomicU64::new(0),
        }
    }

    /// The CPU this queue belongs to.
    #[must_use]
    pub fn cpu_id(&self) -> CpuId {
        self.cpu
    }

    /// Monotonic count of tasks picked off this queue.
    #[must_use]
    pub fn switch_context_counter(&self) -> u64 {
        self.switch_contexts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Appends `task` at the tail, consuming the given reference.
    ///
    /// # Panics
    ///
    /// Panics if the task is already on a queue; double insertion is a
    /// contract violation.
    pub fn insert(&'static self, task: TaskRef) {
        let mut tasks = self.tasks.lock();
        assert!(
            task.run_queue().is_none(),
            "task {} inserted into cpu {} queue while already on cpu {} queue",
            task.pid(),
            self.cpu,
            task.run_queue().map_or(CpuId::new(usize::MAX), RunQueue::cpu_id),
        );
        task.set_run_queue(Some(self));
        tasks.push_back(task);
    }

    /// Unlinks `task` if this queue holds it. Returns whether it did.
    pub fn remove(&self, task: &Task) -> bool {
        let removed = {
            let mut tasks = self.tasks.lock();
            let Some(at) = tasks.iter().position(|t| t.ptr_eq_task(task)) else {
                return false;
            };
            task.set_run_queue(None);
            tasks.remove(at)
        };
        // Reference dropped here, outside the lock.
        drop(removed);
        true
    }

    /// Pops the head task and bumps the switch counter.
    pub fn pick_next(&self) -> Option<TaskRef> {
        let task = {
            let mut tasks = self.tasks.lock();
            let task = tasks.pop_front()?;
            task.set_run_queue(None);
            task
        };
        self.switch_contexts.fetch_add(1, Ordering::Relaxed);
        Some(task)
    }
}
