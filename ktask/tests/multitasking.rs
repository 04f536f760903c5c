// Copyright 2026 ktask Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end single-CPU scenarios.
//!
//! The test thread becomes CPU 0's bootstrap task and drives every scenario
//! from inside the scheduling world, the way a kernel boot flow would.
//! Scenarios run sequentially in one `#[test]` because they share the global
//! task table and CPU 0. Assertions inside *spawned* tasks are avoided
//! (their panics cannot unwind out of the entry trampoline); spawned tasks
//! record into atomics and the bootstrap task asserts.

mod common;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use ktask::cpu::{self, cpu_table};
use ktask::params::Parameters;
use ktask::sched;
use ktask::selftest;
use ktask::task::table::task_table;
use ktask::task::{TaskRef, TaskState};

#[test]
fn single_cpu_world() {
    common::init_clock();

    let cpu = cpu::bring_up(&Parameters::default());
    let outcome: Arc<std::sync::Mutex<Option<String>>> = Arc::new(std::sync::Mutex::new(None));

    {
        let outcome = outcome.clone();
        cpu.run(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(scenarios));
            if let Err(panic) = result {
                let msg = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "non-string panic".to_string());
                *outcome.lock().unwrap() = Some(msg);
            }
        })
        .unwrap();
    }

    if let Some(failure) = outcome.lock().unwrap().take() {
        panic!("scenario failed inside the scheduling world: {failure}");
    }

    // The world wound down: every task exited and was unregistered.
    assert!(task_table().is_empty());
    assert!(cpu_table().running_cpus().is_empty());
}

/// Everything below runs as CPU 0's bootstrap task.
fn scenarios() {
    entry_bootstrap();
    let survivors = print_and_sleep_pair();
    selftest::multitasking(2).unwrap();
    stack_invariants_under_load();
    cooperative_stop();
    preemption_gate();
    ps_listing();

    // By now later scenarios have cycled the reaper slot, so the earliest
    // tasks must be down to exactly our references.
    for task in survivors {
        assert_eq!(task.ref_count(), 1);
    }
}

/// The first context switch into a fresh task lands in its entry with the
/// captured state intact, a valid pid, and the task observably current.
fn entry_bootstrap() {
    let magic = 0xfeed_beefusize;
    let seen = Arc::new(AtomicUsize::new(0));
    let coherent = Arc::new(AtomicBool::new(false));

    let task = TaskRef::new(format_args!("prop/bootstrap"));
    task.start({
        let seen = seen.clone();
        let coherent = coherent.clone();
        move || {
            let me = TaskRef::current();
            let good = me.pid().is_valid()
                && me.state() == TaskState::Running
                && me.name().as_str() == "prop/bootstrap";
            coherent.store(good, Ordering::Release);
            seen.store(magic, Ordering::Release);
        }
    })
    .unwrap();

    task.wait();
    assert_eq!(seen.load(Ordering::Acquire), magic);
    assert!(coherent.load(Ordering::Acquire));
    assert_eq!(task.state(), TaskState::Exited);
}

/// Two tasks print and sleep twice, are joined, and show sane accounting.
fn print_and_sleep_pair() -> Vec<TaskRef> {
    let beats = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<TaskRef> = (0..2)
        .map(|i| TaskRef::new(format_args!("pair/{i}")))
        .collect();
    for task in &tasks {
        task.start({
            let beats = beats.clone();
            move || {
                for _ in 0..2 {
                    log::info!("tick from {}", TaskRef::current().name());
                    beats.fetch_add(1, Ordering::Relaxed);
                    sched::sleep(Duration::from_millis(50));
                }
            }
        })
        .unwrap();
    }

    for task in &tasks {
        task.wait();
    }

    assert_eq!(beats.load(Ordering::Relaxed), 4);
    for task in &tasks {
        assert_eq!(task.state(), TaskState::Exited);
        assert!(task.context_switches() >= 2, "too few context switches");
        assert!(task.runtime() > Duration::ZERO);
        assert!(task.exit_time() > task.start_time());
        task.verify_stack();
    }

    tasks
}

/// Stack magics, guard band and saved stack pointers stay intact while a
/// batch of tasks churns through the scheduler.
fn stack_invariants_under_load() {
    let tasks: Vec<TaskRef> = (0..4)
        .map(|i| TaskRef::new(format_args!("load/{i}")))
        .collect();
    for task in &tasks {
        task.start(|| {
            for _ in 0..8 {
                sched::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();
    }

    // Re-check everything the table knows about, repeatedly, while the
    // batch rotates through this CPU.
    for _ in 0..32 {
        task_table().for_each(|task| task.verify_stack());
        sched::yield_now();
    }

    for task in &tasks {
        task.wait();
        task.verify_stack();
    }
}

/// The stopping flag is advisory: the task sees it at its next check and
/// winds down; the joiner observes the exit.
fn cooperative_stop() {
    let acknowledged = Arc::new(AtomicBool::new(false));

    let task = TaskRef::new(format_args!("stopper"));
    task.start({
        let acknowledged = acknowledged.clone();
        move || {
            while !TaskRef::current().is_stopping() {
                sched::sleep(Duration::from_millis(1));
            }
            acknowledged.store(true, Ordering::Release);
        }
    })
    .unwrap();

    sched::sleep(Duration::from_millis(10));
    task.set_stopping();
    task.wait();

    assert!(acknowledged.load(Ordering::Acquire));
    assert_eq!(task.state(), TaskState::Exited);
}

/// Timer ticks reschedule only while the preempt count is zero.
fn preemption_gate() {
    let task = TaskRef::new(format_args!("preempt/victim"));
    task.start(|| sched::sleep(Duration::from_millis(100))).unwrap();

    let me = TaskRef::current();
    {
        let _guard = sched::preempt_disable();
        let before = me.context_switches();
        sched::tick();
        assert_eq!(me.context_switches(), before, "tick switched despite preempt_disable");
    }

    let before = me.context_switches();
    sched::tick();
    assert!(me.context_switches() > before, "tick did not reschedule");

    task.wait();
}

/// The `ps` surface: header plus one line per live task.
fn ps_listing() {
    let mut out = String::new();
    task_table().ps(&mut out).unwrap();

    let mut lines = out.lines();
    assert_eq!(lines.next(), Some("pid state flags runtime ctxswitches name"));

    // The bootstrap task is the only live task by now, and it is Running.
    let line = lines.next().expect("bootstrap task missing from ps");
    let fields: Vec<&str> = line.split_whitespace().collect();
    assert_eq!(fields[5], "cpu/0");
    assert_eq!(fields[1], "1");
    assert!(lines.next().is_none());

    // The shell command route only logs, but must not error.
    ktask::shell::eval("ps");
    ktask::shell::eval("uptime");
}
