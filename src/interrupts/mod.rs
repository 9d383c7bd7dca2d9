//! Interrupt-level control.
//!
//! The scheduler's critical sections run with interrupts masked; this
//! module is the one place that knows how. On bare metal it wraps the
//! CPU flags, elsewhere a software level stands in so the same
//! discipline (and the same assertions) hold under `cargo test`. It also
//! tracks whether we are inside the timer handler and carries the
//! deferred "yield on return" request the tick path uses for preemption.

use core::sync::atomic::{AtomicBool, Ordering};

/// Interrupts on or off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    Off,
    On,
}

#[cfg(target_os = "none")]
mod level {
    use super::IntrLevel;
    use x86_64::instructions::interrupts as hw;

    pub fn get() -> IntrLevel {
        if hw::are_enabled() {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    pub fn set(level: IntrLevel) {
        match level {
            IntrLevel::On => hw::enable(),
            IntrLevel::Off => hw::disable(),
        }
    }

    pub fn wait() {
        hw::enable_and_hlt();
    }
}

#[cfg(not(target_os = "none"))]
mod level {
    use super::IntrLevel;
    use core::sync::atomic::{AtomicBool, Ordering};

    static ENABLED: AtomicBool = AtomicBool::new(false);

    pub fn get() -> IntrLevel {
        if ENABLED.load(Ordering::SeqCst) {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    pub fn set(l: IntrLevel) {
        ENABLED.store(l == IntrLevel::On, Ordering::SeqCst);
    }

    pub fn wait() {
        set(IntrLevel::On);
        core::hint::spin_loop();
    }
}

static IN_CONTEXT: AtomicBool = AtomicBool::new(false);
static YIELD_ON_RETURN: AtomicBool = AtomicBool::new(false);

/// Current interrupt level.
pub fn get_level() -> IntrLevel {
    level::get()
}

/// Set the interrupt level; returns the previous one.
pub fn set_level(l: IntrLevel) -> IntrLevel {
    let old = level::get();
    level::set(l);
    old
}

/// Mask interrupts; returns the previous level for `set_level`.
pub fn disable() -> IntrLevel {
    set_level(IntrLevel::Off)
}

/// Unmask interrupts; returns the previous level.
pub fn enable() -> IntrLevel {
    assert!(
        !in_context(),
        "interrupts cannot be enabled inside an interrupt handler"
    );
    set_level(IntrLevel::On)
}

/// Run `f` with interrupts masked, restoring the previous level after.
pub fn without_interrupts<T>(f: impl FnOnce() -> T) -> T {
    let old = disable();
    let result = f();
    set_level(old);
    result
}

/// True while an interrupt handler (the timer tick) is executing.
pub fn in_context() -> bool {
    IN_CONTEXT.load(Ordering::SeqCst)
}

pub(crate) fn set_context(value: bool) {
    IN_CONTEXT.store(value, Ordering::SeqCst);
}

/// Ask for the CPU to be yielded once the interrupt handler returns.
pub fn yield_on_return() {
    YIELD_ON_RETURN.store(true, Ordering::SeqCst);
}

pub(crate) fn take_yield_request() -> bool {
    YIELD_ON_RETURN.swap(false, Ordering::SeqCst)
}

/// Enable interrupts and wait for the next one. The idle thread parks
/// here; on bare metal the enable and the halt are atomic.
pub fn wait() {
    level::wait();
}
