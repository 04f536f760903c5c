// Copyright 2026 ktask Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task objects.
//!
//! A [`Task`] is a kernel-mode schedulable execution context: a stack, a
//! saved register frame, a lifecycle state, an affinity mask, timing
//! counters and a name. Tasks are shared through [`TaskRef`] handles; the
//! reference count is the `Arc` strong count, so cloning a handle takes a
//! reference and dropping one releases it, and the last drop tears the task
//! down (stack first).
//!
//! # Current-task discovery
//!
//! There are no thread-locals here. The running task is recovered from the
//! stack pointer alone: stacks are size-aligned, carry boundary magics and a
//! back-pointer, and [`Task::current`] validates all of them before
//! trusting the result. Code below a task (the scheduler, `sleep`, `exit`)
//! leans on this exclusively.

pub mod stack;
pub mod table;

use core::cell::UnsafeCell;
use core::fmt;
use core::fmt::Write as _;
use core::ops::Deref;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use alloc::boxed::Box;
use alloc::sync::Arc;

use arrayvec::ArrayString;
use spin::Mutex;

use crate::cpu::{CpuId, CpuMask};
use crate::sched;
use crate::sched::queue::RunQueue;
use crate::task::stack::OwnedStack;
use crate::time::Instant;
use crate::{Error, object_table::ObjectId};

pub use stack::Stack;

/// Capacity of a task's name buffer.
pub const TASK_NAME_LEN: usize = 64;

const TASK_MAGIC: usize = 0x7461_736b_7461_736b; // "tasktask"

/// A task's entry point. Captured state plays the role the classic
/// `fn(ctx: *mut c_void)` pair would.
pub(crate) type TaskEntry = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle state. Transitions are monotonic in the sense that `Exited` is
/// terminal; a task bounces between `Waiting` and `Running` until then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Runnable (or not yet started); on a run-queue or about to be.
    Waiting = 0,
    /// The task some CPU is executing right now.
    Running = 1,
    /// Finished. Terminal.
    Exited = 2,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Waiting,
            1 => Self::Running,
            2 => Self::Exited,
            _ => unreachable!("invalid task state {raw}"),
        }
    }
}

bitflags::bitflags! {
    /// Advisory task flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: usize {
        /// Cooperative-cancellation request; tasks observe it via
        /// [`Task::is_stopping`], nothing enforces it.
        const STOPPING = 1 << 0;
    }
}

struct TaskInner {
    name: ArrayString<TASK_NAME_LEN>,
    affinity: CpuMask,
}

/// A schedulable execution context. See the module docs.
pub struct Task {
    magic: usize,
    state: AtomicU8,
    flags: AtomicUsize,
    pid: AtomicUsize,
    /// The CPU this task was last scheduled on; maintained by the scheduler
    /// at every switch-in and used to find "the current CPU".
    cpu: AtomicUsize,
    context_switches: AtomicU64,
    start_time: AtomicU64,
    run_start_time: AtomicU64,
    exit_time: AtomicU64,
    runtime: AtomicU64,
    /// Saved stack pointer of a suspended task; written by the context
    /// switch itself through [`rsp_ptr`](Self::rsp_ptr).
    rsp: UnsafeCell<usize>,
    /// The run-queue whose list currently holds this task, or null. Only
    /// mutated under that queue's lock.
    run_queue: AtomicPtr<RunQueue>,
    inner: Mutex<TaskInner>,
    entry: Mutex<Option<TaskEntry>>,
    stack: Mutex<Option<OwnedStack>>,
}

// Safety: every mutable field is either atomic, behind a spinlock, or (for
// `rsp`) written only through the context-switch protocol, which gives the
// suspending CPU exclusive access to it.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

/// A counted reference to a [`Task`].
#[derive(Clone)]
pub struct TaskRef(Arc<Task>);

impl Deref for TaskRef {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.0
    }
}

impl TaskRef {
    /// Creates a task with a formatted name. The returned handle is the
    /// creator's reference; the task has no stack and no pid until
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(name: fmt::Arguments<'_>) -> Self {
        let mut buf = ArrayString::new();
        // Overlong names are truncated at the buffer boundary.
        let _ = buf.write_fmt(name);

        Self(Arc::new(Task {
            magic: TASK_MAGIC,
            state: AtomicU8::new(TaskState::Waiting as u8),
            flags: AtomicUsize::new(TaskFlags::empty().bits()),
            pid: AtomicUsize::new(ObjectId::INVALID.get()),
            cpu: AtomicUsize::new(0),
            context_switches: AtomicU64::new(0),
            start_time: AtomicU64::new(0),
            run_start_time: AtomicU64::new(0),
            exit_time: AtomicU64::new(0),
            runtime: AtomicU64::new(0),
            rsp: UnsafeCell::new(0),
            run_queue: AtomicPtr::new(ptr::null_mut()),
            inner: Mutex::new(TaskInner {
                name: buf,
                affinity: CpuMask::ALL,
            }),
            entry: Mutex::new(None),
            stack: Mutex::new(None),
        }))
    }

    /// Makes the task runnable: allocates its stack, registers it in the
    /// task table (assigning a pid), synthesizes the initial register frame,
    /// and inserts it into the run-queue chosen by the placement policy.
    ///
    /// Must be called at most once. Every failure rolls the task back to its
    /// pre-start state: no stack, no pid, only the caller's references.
    pub fn start<F>(&self, f: F) -> crate::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.prepare(Box::new(f))?;

        let trampoline: extern "C" fn(*const Task) -> ! = task_entry;
        // Safety: `prepare` just gave this task a fresh, exclusively owned
        // stack.
        unsafe { self.init_frame(trampoline as usize) };

        self.start_time
            .store(Instant::now().ticks(), Ordering::Relaxed);
        debug_assert_eq!(self.state(), TaskState::Waiting);

        let affinity = self.cpu_affinity();
        let Some(queue) = sched::placement::select_task_queue(affinity, None) else {
            table::task_table().remove(self);
            *self.0.stack.lock() = None;
            *self.0.entry.lock() = None;
            return Err(Error::NoCpu);
        };

        log::trace!(
            "starting task {} ({}) on cpu {}",
            self.pid(),
            self.name(),
            queue.cpu_id()
        );

        // The frame is complete before this insert; the queue lock is the
        // publishing barrier another CPU's scheduler synchronizes with.
        queue.insert(self.clone());
        Ok(())
    }

    /// Stack allocation and table registration shared by [`start`] and CPU
    /// bring-up.
    ///
    /// [`start`]: Self::start
    pub(crate) fn prepare(&self, entry: TaskEntry) -> crate::Result<()> {
        let mut stack_slot = self.0.stack.lock();
        let mut entry_slot = self.0.entry.lock();
        assert!(stack_slot.is_none(), "task started twice (has a stack)");
        assert!(entry_slot.is_none(), "task started twice (has an entry)");

        let stack = OwnedStack::new(Arc::as_ptr(&self.0))?;
        table::task_table().insert(self)?;

        *entry_slot = Some(entry);
        *stack_slot = Some(stack);
        Ok(())
    }

    /// Writes the initial switch frame so that the first context switch into
    /// this task "returns" into `trampoline` with the task pointer as its
    /// argument and interrupts enabled.
    ///
    /// # Safety
    ///
    /// The task must own a stack nothing is executing on.
    pub(crate) unsafe fn init_frame(&self, trampoline: usize) {
        let stack_slot = self.0.stack.lock();
        let stack = stack_slot.as_ref().expect("init_frame without a stack");

        // Safety: the stack top is size-aligned and exclusively ours.
        let rsp =
            unsafe { crate::arch::init_frame(stack.top(), trampoline, Arc::as_ptr(&self.0) as usize) };
        stack.check_rsp(rsp);
        // Safety: the task has never run, nothing else touches `rsp`.
        unsafe { self.rsp.get().write(rsp) };
    }

    /// Returns the reference to the currently running task, recovered from
    /// the stack pointer.
    ///
    /// # Panics
    ///
    /// Panics (fatally, this is a contract violation) if the current stack
    /// is not a task stack or any validation magic is corrupted. Only call
    /// from task context.
    #[must_use]
    pub fn current() -> TaskRef {
        let task = Task::current_raw();
        // Safety: `task` came from a live `Arc` (the CPU's current-task slot
        // holds it while the task runs), so the count is at least one.
        unsafe {
            Arc::increment_strong_count(task as *const Task);
            TaskRef(Arc::from_raw(task))
        }
    }

    /// The number of live references, diagnostics only.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub(crate) fn ptr_eq_task(&self, task: &Task) -> bool {
        ptr::eq(Arc::as_ptr(&self.0), task)
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid())
            .field("name", &self.name().as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Borrows the currently running task without taking a reference.
    ///
    /// The borrow is sound for as long as the caller runs on this task's
    /// stack: the CPU's current-task slot keeps the task alive at least that
    /// long.
    pub(crate) fn current_raw() -> &'static Task {
        let rsp = crate::arch::current_rsp();
        // Safety: we are executing on some stack; if it is not a task stack
        // the validation inside aborts.
        let task = unsafe { stack::task_from_rsp(rsp) };
        // Safety: the back-pointer of a magic-valid stack points at its task.
        let task = unsafe { &*task };
        assert!(
            task.magic == TASK_MAGIC,
            "task magic corrupted ({:#x}) for rsp {rsp:#x}",
            task.magic
        );
        task
    }

    // === identity and naming ===

    /// The task's pid, [`ObjectId::INVALID`] unless the task is in the task
    /// table.
    #[must_use]
    pub fn pid(&self) -> ObjectId {
        ObjectId::new(self.pid.load(Ordering::Relaxed))
    }

    pub(crate) fn set_pid(&self, pid: ObjectId) {
        self.pid.store(pid.get(), Ordering::Relaxed);
    }

    /// A copy of the task's name.
    #[must_use]
    pub fn name(&self) -> ArrayString<TASK_NAME_LEN> {
        self.inner.lock().name
    }

    pub fn set_name(&self, name: fmt::Arguments<'_>) {
        let mut inner = self.inner.lock();
        inner.name.clear();
        let _ = inner.name.write_fmt(name);
    }

    // === state and flags ===

    #[must_use]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, new: TaskState) {
        let old = self.state.swap(new as u8, Ordering::AcqRel);
        assert!(
            old != TaskState::Exited as u8 || new == TaskState::Exited,
            "task {} left the Exited state for {new:?}",
            self.pid()
        );
    }

    #[must_use]
    pub fn flags(&self) -> TaskFlags {
        TaskFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    /// Requests cooperative cancellation. The task sees it through
    /// [`is_stopping`](Self::is_stopping) at its own pace.
    pub fn set_stopping(&self) {
        self.flags
            .fetch_or(TaskFlags::STOPPING.bits(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.flags().contains(TaskFlags::STOPPING)
    }

    // === affinity ===

    /// Restricts the CPUs this task may be placed on. Takes effect at the
    /// next placement; a running task is not migrated.
    pub fn set_cpu_affinity(&self, affinity: CpuMask) {
        self.inner.lock().affinity = affinity;
    }

    #[must_use]
    pub fn cpu_affinity(&self) -> CpuMask {
        self.inner.lock().affinity
    }

    /// The CPU this task last ran on.
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        CpuId::new(self.cpu.load(Ordering::Relaxed))
    }

    // === timing and counters ===

    /// Total time this task has spent in the Running state.
    #[must_use]
    pub fn runtime(&self) -> Duration {
        crate::time::clock().ticks_to_duration(self.runtime.load(Ordering::Relaxed))
    }

    /// How often this task has been switched away from.
    #[must_use]
    pub fn context_switches(&self) -> u64 {
        self.context_switches.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn start_time(&self) -> Instant {
        Instant::from_ticks(self.start_time.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn exit_time(&self) -> Instant {
        Instant::from_ticks(self.exit_time.load(Ordering::Relaxed))
    }

    // === lifecycle ===

    /// Busy-polls `state` in 1 ms slices until the task has exited.
    ///
    /// A join for the self-test and boot flows, not a general primitive;
    /// the caller must itself be a task (it sleeps through the scheduler).
    pub fn wait(&self) {
        while self.state() != TaskState::Exited {
            sched::sleep(Duration::from_millis(1));
        }
    }

    /// Terminates the calling task. Callable only by the current task; the
    /// scheduler never returns into it afterwards.
    pub fn exit(&self) -> ! {
        let current = Task::current_raw();
        assert!(
            ptr::eq(current, self),
            "exit() for task {} called from task {}",
            self.pid(),
            current.pid()
        );

        // Record the time before publishing the state; a joiner that sees
        // `Exited` must also see a settled exit time.
        self.exit_time
            .store(Instant::now().ticks(), Ordering::Relaxed);
        self.set_state(TaskState::Exited);
        table::task_table().remove(self);

        sched::schedule();

        panic!("task {} resumed after exit", self.pid());
    }

    // === scheduler interface ===

    pub(crate) fn set_start_time(&self, now: Instant) {
        self.start_time.store(now.ticks(), Ordering::Relaxed);
    }

    pub(crate) fn note_descheduled(&self, now: Instant) {
        let run_start = self.run_start_time.load(Ordering::Relaxed);
        self.runtime
            .fetch_add(now.ticks().saturating_sub(run_start), Ordering::Relaxed);
        self.context_switches.fetch_add(1, Ordering::Relaxed);
        if self.state() != TaskState::Exited {
            self.set_state(TaskState::Waiting);
        }
    }

    pub(crate) fn note_scheduled_in(&self, now: Instant, cpu: CpuId) {
        self.cpu.store(cpu.get(), Ordering::Relaxed);
        self.run_start_time.store(now.ticks(), Ordering::Relaxed);
        self.set_state(TaskState::Running);
    }

    pub(crate) fn set_exited(&self, now: Instant) {
        self.exit_time.store(now.ticks(), Ordering::Relaxed);
        self.set_state(TaskState::Exited);
    }

    pub(crate) fn take_entry(&self) -> Option<TaskEntry> {
        self.entry.lock().take()
    }

    pub(crate) fn set_run_queue(&self, queue: Option<&'static RunQueue>) {
        let ptr = queue.map_or(ptr::null_mut(), |q| q as *const RunQueue as *mut RunQueue);
        self.run_queue.store(ptr, Ordering::Release);
    }

    /// The run-queue whose list currently holds this task, if any.
    #[must_use]
    pub fn run_queue(&self) -> Option<&'static RunQueue> {
        let ptr = self.run_queue.load(Ordering::Acquire);
        // Safety: queues live in the static CPU table.
        (!ptr.is_null()).then(|| unsafe { &*ptr })
    }

    pub(crate) fn rsp_ptr(&self) -> *mut usize {
        self.rsp.get()
    }

    /// The saved stack pointer of a suspended task. Meaningless while the
    /// task is running.
    pub(crate) fn rsp_value(&self) -> usize {
        // Safety: plain read; the caller asserts the task is suspended.
        unsafe { *self.rsp.get() }
    }

    /// Re-checks the stack invariants: boundary magics intact and, for a
    /// suspended task, the saved stack pointer inside its legal window.
    pub fn verify_stack(&self) {
        let stack_slot = self.stack.lock();
        let Some(stack) = stack_slot.as_ref() else {
            return;
        };
        stack.check_magics();
        if self.state() != TaskState::Running {
            stack.check_rsp(self.rsp_value());
        }
    }

    #[must_use]
    pub fn has_stack(&self) -> bool {
        self.stack.lock().is_some()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        assert!(
            self.run_queue.load(Ordering::Acquire).is_null(),
            "task {} destroyed while on a run-queue",
            self.pid()
        );
        // The stack is released right after this body, exactly once, by the
        // `OwnedStack` drop.
    }
}

/// First code a started task ever runs: invoked by the context switch
/// "returning" out of the synthetic frame, with interrupts enabled and the
/// task pointer in the argument register.
extern "C" fn task_entry(task: *const Task) -> ! {
    // Safety: the CPU's current-task slot holds a reference for as long as
    // this task runs.
    let task = unsafe { &*task };
    let entry = task.take_entry().expect("task entry already consumed");
    entry();
    task.exit()
}
