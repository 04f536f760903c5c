// Copyright 2026 ktask Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! CPUs, affinity masks, and the per-CPU scheduling world.
//!
//! Every CPU owns one [`RunQueue`], a current-task slot, and a reaper slot
//! for deferred teardown of exited tasks. [`Cpu::run`] converts a freshly
//! bootstrapped CPU's context into a task and enters the scheduling world;
//! the call returns once [`Cpu::request_shutdown`] has been honoured and the
//! queue has drained.
//!
//! The current CPU is derived from the current task (which the scheduler
//! stamps at every switch-in), not from a thread-local; the stack-pointer
//! trick in [`task`](crate::task) is the only source of "current" anywhere
//! in this crate.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::BitAnd;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::boxed::Box;

use spin::{Mutex, Once};

use crate::params::Parameters;
use crate::sched::queue::RunQueue;
use crate::task::{Task, TaskRef, table};
use crate::time::Instant;
use crate::{arch, sched};

/// Upper bound on CPUs, sized so a [`CpuMask`] fits a machine word.
pub const MAX_CPUS: usize = usize::BITS as usize;

/// The CPU the firmware boots on.
pub const BOOT_CPU: CpuId = CpuId::new(0);

/// Index of a logical CPU.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct CpuId(usize);

impl CpuId {
    #[must_use]
    pub const fn new(inner: usize) -> Self {
        Self(inner)
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[cpu #{}]", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bit-set of CPUs, one bit per [`CpuId`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CpuMask(usize);

impl CpuMask {
    pub const EMPTY: Self = Self(0);
    /// Every CPU; the default task affinity.
    pub const ALL: Self = Self(usize::MAX);

    #[must_use]
    pub const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> usize {
        self.0
    }

    #[must_use]
    pub const fn single(cpu: CpuId) -> Self {
        Self(1 << cpu.get())
    }

    #[must_use]
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu.get()) != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn insert(&mut self, cpu: CpuId) {
        self.0 |= 1 << cpu.get();
    }

    /// The set CPUs, lowest index first.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        (0..MAX_CPUS)
            .filter(move |i| self.0 & (1 << i) != 0)
            .map(CpuId::new)
    }
}

impl BitAnd for CpuMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

/// One CPU's scheduling state.
pub struct Cpu {
    id: CpuId,
    queue: RunQueue,
    /// The task this CPU is executing; holds the reference that keeps a
    /// running task alive. Only the owning CPU replaces it.
    current: Mutex<Option<TaskRef>>,
    /// Deferred-teardown slot: the most recently descheduled *exited* task.
    /// Its reference is only dropped once the next switch parks a successor
    /// here, i.e. provably after the exited task left its own stack.
    reaper: Mutex<Option<TaskRef>>,
    preempt_count: AtomicUsize,
    shutdown: AtomicBool,
    /// Saved stack pointer of whatever context called [`Cpu::run`]; the
    /// bootstrap task switches back through it on shutdown.
    bootstrap_rsp: UnsafeCell<usize>,
}

// Safety: `bootstrap_rsp` is only accessed by the context entering and the
// task leaving this CPU's world, which cannot overlap; everything else is
// atomic or behind a lock.
unsafe impl Sync for Cpu {}

impl Cpu {
    const fn new(id: CpuId) -> Self {
        Self {
            id,
            queue: RunQueue::new(id),
            current: Mutex::new(None),
            reaper: Mutex::new(None),
            preempt_count: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            bootstrap_rsp: UnsafeCell::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> CpuId {
        self.id
    }

    #[must_use]
    pub fn queue(&'static self) -> &'static RunQueue {
        &self.queue
    }

    /// Asks the bootstrap task to leave the scheduling world once its queue
    /// has drained, returning control to whatever called [`Cpu::run`].
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn preempt_count(&self) -> usize {
        self.preempt_count.load(Ordering::Relaxed)
    }

    pub(crate) fn preempt_disable(&self) {
        self.preempt_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn preempt_enable(&self) {
        let old = self.preempt_count.fetch_sub(1, Ordering::Relaxed);
        assert!(old > 0, "cpu {}: preempt count underflow", self.id);
    }

    pub(crate) fn take_current(&self) -> Option<TaskRef> {
        self.current.lock().take()
    }

    pub(crate) fn set_current(&self, task: TaskRef) {
        *self.current.lock() = Some(task);
    }

    /// Parks a descheduled, exited task for deferred teardown. The previous
    /// occupant's reference is dropped here, which is safe precisely because
    /// a later context switch on this CPU proves the earlier occupant is no
    /// longer executing on its stack.
    pub(crate) fn park_exited(&self, task: TaskRef) {
        let previous = self.reaper.lock().replace(task);
        drop(previous);
    }

    pub(crate) fn bootstrap_rsp_value(&self) -> usize {
        // Safety: read by the departing bootstrap task, strictly after the
        // matching write in `run`.
        unsafe { *self.bootstrap_rsp.get() }
    }

    /// Converts the calling context into this CPU's bootstrap task and
    /// enters the scheduling world.
    ///
    /// `f` runs as the task named `cpu/N`: it can start tasks, sleep, and
    /// schedule; while it does, this CPU picks runnable tasks off its queue.
    /// When `f` returns, the world is torn down and `run` itself returns to
    /// its caller on the original context. `f` must only return once no
    /// task on this CPU still needs to run (see [`Cpu::run_idle`]).
    ///
    /// # Panics
    ///
    /// Panics if this is a secondary CPU and the parameters recorded by
    /// [`bring_up`] say `smp=off`; only the boot CPU may run then.
    pub fn run<F>(&'static self, f: F) -> crate::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            self.id == BOOT_CPU || !smp_off(),
            "cpu {} started while smp is off",
            self.id
        );

        let task = TaskRef::new(format_args!("cpu/{}", self.id));
        task.prepare(Box::new(f))?;

        let trampoline: extern "C" fn(*const Task) -> ! = bootstrap_entry;
        // Safety: `prepare` gave the task a fresh stack nothing runs on.
        unsafe { task.init_frame(trampoline as usize) };

        let now = Instant::now();
        task.set_start_time(now);
        task.note_scheduled_in(now, self.id);

        self.shutdown.store(false, Ordering::Release);
        {
            let mut current = self.current.lock();
            assert!(current.is_none(), "cpu {} entered twice", self.id);
            *current = Some(task.clone());
        }
        // The bootstrap task keeps queue membership while it runs, exactly
        // like a task that was picked without ever suspending; the first
        // schedule() resolves this the same way it resolves a yield.
        self.queue().insert(task.clone());
        cpu_table().mark_online(self.id);
        log::info!("cpu {} online, bootstrap task pid {}", self.id, task.pid());

        // Safety: the frame was just built on the bootstrap task's stack and
        // `bootstrap_rsp` belongs to this call alone.
        unsafe { arch::switch_context(self.bootstrap_rsp.get(), task.rsp_value()) };

        // The bootstrap task wound the world down and switched back.
        cpu_table().mark_offline(self.id);
        *self.current.lock() = None;
        *self.reaper.lock() = None;
        log::info!("cpu {} offline", self.id);

        Ok(())
    }

    /// [`run`](Self::run) with a plain idle loop: keeps the scheduler
    /// turning until shutdown is requested and the queue has drained. The
    /// parking loop of a secondary CPU.
    pub fn run_idle(&'static self) -> crate::Result<()> {
        self.run(move || {
            loop {
                sched::schedule();
                if self.shutdown_requested() && self.queue.is_empty() {
                    break;
                }
                arch::spin_hint();
            }
        })
    }
}

/// First and last code of a CPU's bootstrap task.
extern "C" fn bootstrap_entry(task: *const Task) -> ! {
    // Safety: the CPU's current slot holds a reference while we run.
    let task = unsafe { &*task };
    let entry = task.take_entry().expect("bootstrap entry already consumed");
    entry();

    // Wind down on the bootstrap task's own context, then hand the CPU back.
    let cpu = cpu_table().cpu(task.cpu());
    task.set_exited(Instant::now());
    cpu.queue().remove(task);
    table::task_table().remove(task);
    log::trace!("cpu {}: bootstrap task leaving", cpu.id());

    // Safety: `bootstrap_rsp` was written by the matching switch in `run`,
    // and nobody will ever resume this frame.
    unsafe { arch::switch_context(task.rsp_ptr(), cpu.bootstrap_rsp_value()) };
    unreachable!("cpu bootstrap task resumed after teardown");
}

/// The fixed table of per-CPU state.
pub struct CpuTable {
    cpus: [Cpu; MAX_CPUS],
    running: AtomicUsize,
}

static CPU_TABLE: CpuTable = CpuTable::new();

/// Boot parameters recorded by [`bring_up`]; consulted on every world entry.
static BOOT_PARAMS: Once<Parameters> = Once::new();

/// Records the boot parameters and returns the boot CPU.
///
/// The boot path calls this once, before any CPU enters its scheduling
/// world, then runs the boot CPU's world via [`Cpu::run`] and releases the
/// secondary CPUs. With `smp=off` the secondaries must never be released;
/// a secondary that enters [`Cpu::run`] anyway is a fatal bug.
pub fn bring_up(params: &Parameters) -> &'static Cpu {
    BOOT_PARAMS.call_once(|| *params);
    cpu_table().cpu(BOOT_CPU)
}

fn smp_off() -> bool {
    BOOT_PARAMS.get().is_some_and(Parameters::smp_off)
}

/// Returns the global CPU table.
#[must_use]
pub fn cpu_table() -> &'static CpuTable {
    &CPU_TABLE
}

/// The CPU executing the calling task. Task context only.
#[must_use]
pub fn current_cpu() -> &'static Cpu {
    cpu_table().cpu(Task::current_raw().cpu())
}

impl CpuTable {
    const fn new() -> Self {
        const INIT: Cpu = Cpu::new(CpuId::new(0));
        let mut cpus = [INIT; MAX_CPUS];
        let mut i = 0;
        while i < MAX_CPUS {
            cpus[i].id = CpuId::new(i);
            cpus[i].queue.cpu = CpuId::new(i);
            i += 1;
        }
        Self {
            cpus,
            running: AtomicUsize::new(0),
        }
    }

    /// The per-CPU state of `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    #[must_use]
    pub fn cpu(&self, id: CpuId) -> &Cpu {
        &self.cpus[id.get()]
    }

    /// The set of CPUs currently inside their scheduling world.
    #[must_use]
    pub fn running_cpus(&self) -> CpuMask {
        CpuMask::from_bits(self.running.load(Ordering::Acquire))
    }

    pub(crate) fn mark_online(&self, id: CpuId) {
        self.running
            .fetch_or(CpuMask::single(id).bits(), Ordering::AcqRel);
    }

    pub(crate) fn mark_offline(&self, id: CpuId) {
        self.running
            .fetch_and(!CpuMask::single(id).bits(), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_operations() {
        let mut mask = CpuMask::EMPTY;
        assert!(mask.is_empty());

        mask.insert(CpuId::new(0));
        mask.insert(CpuId::new(5));
        assert!(mask.contains(CpuId::new(0)));
        assert!(mask.contains(CpuId::new(5)));
        assert!(!mask.contains(CpuId::new(1)));

        let ids: Vec<usize> = mask.iter().map(CpuId::get).collect();
        assert_eq!(ids, vec![0, 5]);

        let narrowed = mask & CpuMask::single(CpuId::new(5));
        assert_eq!(narrowed, CpuMask::single(CpuId::new(5)));
        assert_eq!(CpuMask::ALL & mask, mask);
    }

    #[test]
    fn table_ids_match_indices() {
        for i in [0usize, 1, MAX_CPUS - 1] {
            let cpu = cpu_table().cpu(CpuId::new(i));
            assert_eq!(cpu.id().get(), i);
            assert_eq!(cpu.queue.cpu_id().get(), i);
        }
    }

    #[test]
    fn online_mask() {
        // Use high CPU indices so concurrently running tests cannot collide.
        let id = CpuId::new(MAX_CPUS - 3);
        assert!(!cpu_table().running_cpus().contains(id));
        cpu_table().mark_online(id);
        assert!(cpu_table().running_cpus().contains(id));
        cpu_table().mark_offline(id);
        assert!(!cpu_table().running_cpus().contains(id));
    }

    #[test]
    #[should_panic(expected = "smp is off")]
    fn secondary_cpus_are_refused_when_smp_is_off() {
        use core::str::FromStr;

        let params = Parameters::from_str("smp=off").unwrap();
        let boot = bring_up(&params);
        assert_eq!(boot.id(), BOOT_CPU);

        // No other unit test enters a scheduling world, so poisoning the
        // recorded parameters for this process is fine.
        let _ = cpu_table().cpu(CpuId::new(1)).run_idle();
    }

    #[test]
    fn preempt_count_nests() {
        let cpu = cpu_table().cpu(CpuId::new(MAX_CPUS - 4));
        assert_eq!(cpu.preempt_count(), 0);
        cpu.preempt_disable();
        cpu.preempt_disable();
        assert_eq!(cpu.preempt_count(), 2);
        cpu.preempt_enable();
        cpu.preempt_enable();
        assert_eq!(cpu.preempt_count(), 0);
    }
}
