// Copyright 2026 ktask Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::arch::asm;
use core::mem::size_of;

/// RFLAGS bit 9, the interrupt-enable flag.
pub const RFLAGS_IF: usize = 1 << 9;
/// RFLAGS bit 1 always reads as one on x86_64.
pub const RFLAGS_RESERVED: usize = 1 << 1;

/// The register frame saved below the return address by [`switch_context`].
///
/// Fields are in pop order, lowest address first: the saved `rsp` of a
/// suspended task points at `rdi`. `rdi` is not callee-saved; it is carried
/// so that the synthetic frame of a task that has never run can deliver the
/// task pointer as the first argument of its entry trampoline.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rdi: usize,
    pub r15: usize,
    pub r14: usize,
    pub r13: usize,
    pub r12: usize,
    pub rbx: usize,
    pub rbp: usize,
    pub rflags: usize,
}

static_assertions::const_assert_eq!(size_of::<Context>(), 8 * size_of::<usize>());

/// Bytes consumed at the top of a fresh stack by [`init_frame`].
pub const INITIAL_FRAME_SIZE: usize = size_of::<Context>() + 2 * size_of::<usize>();

core::arch::global_asm!(
    ".pushsection .text.__ktask_switch_context, \"ax\", @progbits",
    ".balign 16",
    ".globl __ktask_switch_context",
    ".type __ktask_switch_context, @function",
    // fn(prev_rsp: *mut usize (rdi), next_rsp: usize (rsi))
    "__ktask_switch_context:",
    "pushfq",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "push rdi",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop rdi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "popfq",
    "ret",
    ".size __ktask_switch_context, . - __ktask_switch_context",
    ".popsection",
);

unsafe extern "C" {
    fn __ktask_switch_context(prev_rsp: *mut usize, next_rsp: usize);
}

/// Suspends the current context and resumes the one whose saved stack
/// pointer is `next_rsp`.
///
/// Pushes a [`Context`] onto the current stack, stores the resulting `rsp`
/// through `prev_rsp`, loads `next_rsp`, pops the frame found there and
/// returns to the word above it. The call appears to return normally once
/// somebody switches back to `prev_rsp`.
///
/// # Safety
///
/// `next_rsp` must point at a well-formed [`Context`] frame on a live stack
/// (either written by a previous switch or by [`init_frame`]), and
/// `prev_rsp` must stay valid until the suspended context is resumed or
/// abandoned.
pub unsafe fn switch_context(prev_rsp: *mut usize, next_rsp: usize) {
    // Safety: forwarded to the caller.
    unsafe { __ktask_switch_context(prev_rsp, next_rsp) }
}

/// Writes the initial switch frame for a task that has never run.
///
/// From the top down: a zero terminator word (also keeps `rsp` at the
/// ABI-required `top - 8 (mod 16)` when the entry is reached), the entry's
/// return target, then a [`Context`] with all registers zeroed except the
/// argument register (`arg`) and a flags word with interrupts enabled.
/// Returns the initial saved `rsp`, suitable for [`switch_context`].
///
/// # Safety
///
/// `top` must be the 16-byte aligned, exclusively owned top of a writable
/// region with at least [`INITIAL_FRAME_SIZE`] bytes below it.
pub unsafe fn init_frame(top: usize, entry: usize, arg: usize) -> usize {
    debug_assert_eq!(top % 16, 0, "stack top {top:#x} is not 16-byte aligned");

    // Safety: per the caller's contract the whole frame lies inside the
    // owned stack region.
    unsafe {
        let mut sp = top;
        sp -= size_of::<usize>();
        (sp as *mut usize).write(0);
        sp -= size_of::<usize>();
        (sp as *mut usize).write(entry);
        sp -= size_of::<Context>();
        (sp as *mut Context).write(Context {
            rdi: arg,
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            rflags: RFLAGS_IF | RFLAGS_RESERVED,
        });
        sp
    }
}

/// Reads the current stack pointer.
#[inline(always)]
pub fn current_rsp() -> usize {
    let rsp: usize;
    // Safety: reading rsp has no side effects.
    unsafe { asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags)) };
    rsp
}

/// Disables maskable interrupts until the returned guard is dropped.
#[cfg(target_os = "none")]
pub fn disable_interrupts() -> InterruptGuard {
    let rflags: usize;
    // Safety: reading rflags and masking interrupts is always sound in
    // ring 0.
    unsafe {
        asm!("pushfq", "pop {}", out(reg) rflags, options(preserves_flags));
        asm!("cli", options(nomem, nostack));
    }
    InterruptGuard {
        reenable: rflags & RFLAGS_IF != 0,
    }
}

/// Disables maskable interrupts until the returned guard is dropped.
///
/// On hosted builds (the test suite) this is a no-op; scheduling there is
/// purely cooperative and the timer-interrupt entry point is never wired up.
#[cfg(not(target_os = "none"))]
pub fn disable_interrupts() -> InterruptGuard {
    InterruptGuard { reenable: false }
}

/// Restores the pre-[`disable_interrupts`] interrupt flag on drop.
#[must_use]
pub struct InterruptGuard {
    #[cfg_attr(
        not(target_os = "none"),
        expect(dead_code, reason = "only consulted where interrupts exist")
    )]
    reenable: bool,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        #[cfg(target_os = "none")]
        if self.reenable {
            // Safety: re-enabling what this guard disabled.
            unsafe { asm!("sti", options(nomem, nostack)) };
        }
    }
}

/// Polite busy-wait hint for idle and poll loops.
#[inline(always)]
pub fn spin_hint() {
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_frame_layout() {
        #[repr(C, align(16))]
        struct Region([u8; 256]);
        let mut region = Region([0; 256]);

        let top = region.0.as_mut_ptr() as usize + 256;
        let sp = unsafe { init_frame(top, 0xdead_beef, 0x1234) };

        assert_eq!(top - sp, INITIAL_FRAME_SIZE);

        let ctx = unsafe { &*(sp as *const Context) };
        assert_eq!(ctx.rdi, 0x1234);
        assert_eq!(ctx.rbx, 0);
        assert_eq!(ctx.rflags & RFLAGS_IF, RFLAGS_IF);

        let ret_target = unsafe { *((sp + size_of::<Context>()) as *const usize) };
        assert_eq!(ret_target, 0xdead_beef);

        // After the frame is popped and `ret` consumed, rsp sits one word
        // below the top, which is what the SysV ABI expects at entry.
        assert_eq!((top - size_of::<usize>()) % 16, 8);
    }

    #[test]
    fn switch_round_trip() {
        // A minimal coroutine: switch into a synthetic frame, have the entry
        // switch straight back, and observe that both sides ran.
        #[repr(C, align(16))]
        struct Region([u8; 16 * 1024]);

        struct Shared {
            host_rsp: usize,
            child_rsp: usize,
            seen_arg: usize,
        }

        extern "C" fn entry(shared: *mut Shared) -> ! {
            // Safety: the host side keeps `shared` alive while the child
            // context runs; `host_rsp` was stored by the switch that brought
            // us here.
            unsafe {
                (*shared).seen_arg = shared as usize;
                let host_rsp = (*shared).host_rsp;
                switch_context(&raw mut (*shared).child_rsp, host_rsp);
            }
            unreachable!("abandoned context resumed");
        }

        let mut region = Box::new(Region([0; 16 * 1024]));
        let mut shared = Shared {
            host_rsp: 0,
            child_rsp: 0,
            seen_arg: 0,
        };

        let top = region.0.as_mut_ptr() as usize + size_of::<Region>();
        let entry_fn: extern "C" fn(*mut Shared) -> ! = entry;
        let child_rsp = unsafe { init_frame(top, entry_fn as usize, &raw mut shared as usize) };

        // Safety: `child_rsp` was just written by `init_frame` on an owned,
        // aligned region.
        unsafe { switch_context(&raw mut shared.host_rsp, child_rsp) };

        assert_eq!(shared.seen_arg, &raw const shared as usize);
        assert_ne!(shared.child_rsp, 0);
        assert!(shared.child_rsp < top && shared.child_rsp > top - size_of::<Region>());
    }
}
