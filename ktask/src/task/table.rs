// Copyright 2026 ktask Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The live-task registry.
//!
//! Two structures under the hood: an [`ObjectTable`] allocating pids and
//! keeping one reference per live task, and a set of pointer-hashed shards
//! (each under its own lock) that make iteration for `ps` cheap without a
//! global lock. A task is in the table exactly while its pid is valid.

use core::fmt;

use alloc::vec::Vec;

use spin::Mutex;

use crate::object_table::{ObjectId, ObjectTable};
use crate::task::{Task, TaskRef};
use crate::Error;

/// Capacity of the pid table.
pub const MAX_TASKS: usize = 256;

const SHARDS: usize = 16;

static TASK_TABLE: TaskTable = TaskTable::new();

/// Returns the global task table.
#[must_use]
pub fn task_table() -> &'static TaskTable {
    &TASK_TABLE
}

pub struct TaskTable {
    ids: ObjectTable<TaskRef, MAX_TASKS>,
    shards: [Mutex<Vec<TaskRef>>; SHARDS],
}

impl TaskTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ids: ObjectTable::new(),
            shards: [const { Mutex::new(Vec::new()) }; SHARDS],
        }
    }

    fn shard_of(&self, task: &Task) -> &Mutex<Vec<TaskRef>> {
        let addr = task as *const Task as usize;
        // Fibonacci hash over the pointer; the low bits are alignment noise.
        let hash = (addr >> 4).wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 48;
        &self.shards[hash % SHARDS]
    }

    /// Registers `task`, assigning it a pid. The table keeps references of
    /// its own until [`remove`](Self::remove).
    pub fn insert(&self, task: &TaskRef) -> crate::Result<()> {
        let pid = self.ids.insert(task.clone()).ok_or(Error::TableFull)?;
        task.set_pid(pid);

        let mut shard = self.shard_of(task).lock();
        assert!(
            !shard.iter().any(|t| t.ptr_eq_task(task)),
            "task {pid} inserted into the task table twice"
        );
        shard.push(task.clone());
        Ok(())
    }

    /// Unregisters `task`, invalidating its pid and dropping the table's
    /// references.
    pub fn remove(&self, task: &Task) {
        let pid = task.pid();
        assert!(pid.is_valid(), "removing a task that has no pid");

        let from_ids = self.ids.remove(pid);
        task.set_pid(ObjectId::INVALID);

        let from_shard = {
            let mut shard = self.shard_of(task).lock();
            let at = shard
                .iter()
                .position(|t| t.ptr_eq_task(task))
                .expect("task had a pid but was on no table shard");
            shard.remove(at)
        };

        // Both table references go here, outside the locks.
        drop(from_shard);
        drop(from_ids);
    }

    /// Returns an extra reference to the task with `pid`, if it is live.
    /// The caller owns (and eventually drops) the reference.
    #[must_use]
    pub fn lookup(&self, pid: ObjectId) -> Option<TaskRef> {
        self.ids.lookup(pid)
    }

    /// The number of live tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Calls `f` for every live task, shard by shard under each shard's
    /// lock. There is no cross-shard ordering.
    pub fn for_each(&self, mut f: impl FnMut(&TaskRef)) {
        for shard in &self.shards {
            for task in shard.lock().iter() {
                f(task);
            }
        }
    }

    /// Renders the `ps` listing: a header, then one line per task in the
    /// order `pid state flags runtime ctxswitches name`, with the state as
    /// its decimal encoding, the flags in hex and the runtime as
    /// `seconds.microseconds`.
    pub fn ps(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "pid state flags runtime ctxswitches name")?;
        for shard in &self.shards {
            for task in shard.lock().iter() {
                let runtime = task.runtime();
                writeln!(
                    out,
                    "{} {} {:#x} {}.{} {} {}",
                    task.pid(),
                    task.state() as u8,
                    task.flags().bits(),
                    runtime.as_secs(),
                    runtime.subsec_micros(),
                    task.context_switches(),
                    task.name()
                )?;
            }
        }
        Ok(())
    }

    /// Tears every entry out of the table, for orderly shutdown. Returns
    /// how many tasks were still registered.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        for shard in &self.shards {
            let tasks: Vec<TaskRef> = core::mem::take(&mut *shard.lock());
            for task in &tasks {
                task.set_pid(ObjectId::INVALID);
            }
            drained += tasks.len();
            drop(tasks);
        }
        self.ids.drain();
        drained
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}
