//! The context-switch seam.
//!
//! Everything above this file is portable; this is the one module that
//! knows how a thread actually gives up the CPU. On bare metal the
//! switch saves the callee-saved registers on the outgoing stack and
//! swaps stack pointers. On hosted builds each kernel thread is an OS
//! thread holding a permit-counting parker; a switch grants the incoming
//! thread's permit and then blocks on our own, so exactly one kernel
//! thread runs at any moment and the cooperative single-CPU semantics
//! carry over unchanged.

#[cfg(target_os = "none")]
mod imp {
    use core::arch::naked_asm;
    use core::cell::UnsafeCell;

    /// Callee-saved register state per the System V x86-64 ABI, plus the
    /// resume address.
    #[derive(Debug, Clone, Copy)]
    #[repr(C)]
    pub struct Registers {
        pub rsp: u64,
        pub rbp: u64,
        pub rbx: u64,
        pub r12: u64,
        pub r13: u64,
        pub r14: u64,
        pub r15: u64,
        pub rip: u64,
    }

    impl Registers {
        const fn zeroed() -> Registers {
            Registers {
                rsp: 0,
                rbp: 0,
                rbx: 0,
                r12: 0,
                r13: 0,
                r14: 0,
                r15: 0,
                rip: 0,
            }
        }
    }

    pub struct Context {
        regs: UnsafeCell<Registers>,
    }

    impl Context {
        /// For the thread that is already running when the scheduler
        /// comes up; filled in on its first switch away.
        pub fn empty() -> Context {
            Context {
                regs: UnsafeCell::new(Registers::zeroed()),
            }
        }

        /// For a fresh thread: the first switch "returns" into `entry`
        /// at the top of its new stack. The stack pointer is placed so
        /// `entry` sees the ABI-required alignment.
        pub fn fresh(entry: u64, stack_top: u64) -> Context {
            let mut regs = Registers::zeroed();
            regs.rsp = (stack_top & !0xF) - 8;
            regs.rip = entry;
            Context {
                regs: UnsafeCell::new(regs),
            }
        }

        pub(crate) fn regs_ptr(&self) -> *mut Registers {
            self.regs.get()
        }
    }

    /// Save the callee-saved state into `old`, load `new`, and continue
    /// wherever `new` last left off.
    ///
    /// # Safety
    ///
    /// Both pointers must refer to live `Registers` whose stacks remain
    /// valid for the lifetime of the threads involved.
    #[unsafe(naked)]
    pub unsafe extern "C" fn switch_registers(old: *mut Registers, new: *const Registers) {
        naked_asm!(
            "mov [rdi + 0x00], rsp",
            "mov [rdi + 0x08], rbp",
            "mov [rdi + 0x10], rbx",
            "mov [rdi + 0x18], r12",
            "mov [rdi + 0x20], r13",
            "mov [rdi + 0x28], r14",
            "mov [rdi + 0x30], r15",
            "lea rax, [rip + 2f]",
            "mov [rdi + 0x38], rax",
            "mov rsp, [rsi + 0x00]",
            "mov rbp, [rsi + 0x08]",
            "mov rbx, [rsi + 0x10]",
            "mov r12, [rsi + 0x18]",
            "mov r13, [rsi + 0x20]",
            "mov r14, [rsi + 0x28]",
            "mov r15, [rsi + 0x30]",
            "jmp [rsi + 0x38]",
            "2:",
            "ret",
        );
    }

    /// Load `new` without saving anything; the caller's thread is dying
    /// and its stack is about to be reclaimed.
    ///
    /// # Safety
    ///
    /// As for `switch_registers`.
    #[unsafe(naked)]
    pub unsafe extern "C" fn jump_registers(new: *const Registers) -> ! {
        naked_asm!(
            "mov rsp, [rdi + 0x00]",
            "mov rbp, [rdi + 0x08]",
            "mov rbx, [rdi + 0x10]",
            "mov r12, [rdi + 0x18]",
            "mov r13, [rdi + 0x20]",
            "mov r14, [rdi + 0x28]",
            "mov r15, [rdi + 0x30]",
            "jmp [rdi + 0x38]",
        );
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    use std::sync::{Condvar, Mutex};

    struct Parker {
        permits: Mutex<usize>,
        cvar: Condvar,
    }

    impl Parker {
        fn new() -> Parker {
            Parker {
                permits: Mutex::new(0),
                cvar: Condvar::new(),
            }
        }

        fn park(&self) {
            let mut permits = self.permits.lock().unwrap();
            while *permits == 0 {
                permits = self.cvar.wait(permits).unwrap();
            }
            *permits -= 1;
        }

        fn unpark(&self) {
            let mut permits = self.permits.lock().unwrap();
            *permits += 1;
            self.cvar.notify_one();
        }
    }

    pub struct Context {
        parker: Parker,
    }

    impl Context {
        pub fn empty() -> Context {
            Context {
                parker: Parker::new(),
            }
        }

        /// Block until this thread is switched to again. Permits are
        /// counted, so a wakeup that races our own park is not lost.
        pub(crate) fn park(&self) {
            self.parker.park();
        }

        pub(crate) fn unpark(&self) {
            self.parker.unpark();
        }
    }
}

pub use imp::Context;
#[cfg(target_os = "none")]
pub use imp::{jump_registers, switch_registers, Registers};
