//! The context-switch primitive: the callee-saved register frame that
//! lives at the top of a suspended thread's stack, and the assembly
//! routine that swaps stacks.
//!
//! A suspended thread's stack pointer points at a [`Context`]; resuming
//! pops the registers and `ret`s into `rip`. A brand-new thread gets a
//! hand-built `Context` whose `rip` is its entry trampoline.

#![no_std]

use zerocopy::FromBytes;

/// The registers saved across a context switch.
///
/// The field order MUST match the pop order in the switch routine below.
#[derive(FromBytes)]
#[repr(C, packed)]
pub struct Context {
    rflags: usize,
    r15: usize,
    r14: usize,
    r13: usize,
    r12: usize,
    rbp: usize,
    rbx: usize,
    /// Implicitly pushed by `call` and popped by `ret`; pointing the
    /// stack at a `Context` makes the final `ret` jump to this address.
    rip: usize,
}

impl Context {
    /// A fresh context that will begin execution at `rip`.
    pub fn new(rip: usize) -> Context {
        Context {
            // Bit 9 is the interrupt-enable flag: a new thread starts
            // with interrupts on.
            rflags: 1 << 9,
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbp: 0,
            rbx: 0,
            rip,
        }
    }

    /// Stashes a value in the first callee-saved register so the entry
    /// trampoline can recover it after the first switch-in.
    pub fn set_first_register(&mut self, value: usize) {
        self.r15 = value;
    }
}

/// Seeds a new thread's stack with a [`Context`] returning the initial
/// stack pointer to store in its control block.
///
/// # Safety
/// `stack_top` must be the exclusive top of a writable stack with room
/// for at least one `Context`, 16-byte aligned.
pub unsafe fn prepare_stack(stack_top: *mut u8, entry: usize, first_register: usize) -> usize {
    let mut context = Context::new(entry);
    context.set_first_register(first_register);
    let sp = (stack_top as usize - core::mem::size_of::<Context>()) & !0xF;
    unsafe { (sp as *mut Context).write(context) };
    sp
}

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
    .global nexke_context_switch
    nexke_context_switch:
        push rbx
        push rbp
        push r12
        push r13
        push r14
        push r15
        pushfq
        mov [rdi], rsp
        mov rsp, rsi
        popfq
        pop r15
        pop r14
        pop r13
        pop r12
        pop rbp
        pop rbx
        ret
    "#
);

#[cfg(target_arch = "x86_64")]
extern "C" {
    fn nexke_context_switch(prev_stack_pointer: *mut usize, next_stack_pointer: usize);
}

/// Switches from the current thread to the one whose saved stack pointer
/// is `next_stack_pointer`, saving the current registers through
/// `prev_stack_pointer`.
///
/// # Safety
/// Both stack pointers must be valid: `next` must point at a `Context`
/// laid down by a previous switch or [`prepare_stack`], and `prev` must
/// be a live slot the thread can later be resumed from.
pub unsafe fn switch_context(prev_stack_pointer: *mut usize, next_stack_pointer: usize) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        nexke_context_switch(prev_stack_pointer, next_stack_pointer)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (prev_stack_pointer, next_stack_pointer);
        unimplemented!("context switching is only implemented for x86_64");
    }
}
