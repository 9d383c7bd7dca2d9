//! Timer tick entry point.
//!
//! The timer device itself is external; whatever owns the interrupt
//! calls `tick()` once per tick with interrupts masked. The scheduler's
//! accounting runs in interrupt context, and a preemption requested
//! during the tick is honored as the handler unwinds.

use crate::interrupts;
use crate::scheduler;
use core::sync::atomic::{AtomicI64, Ordering};

/// Timer ticks per second.
pub const TIMER_FREQ: u32 = 100;

static TICKS: AtomicI64 = AtomicI64::new(0);

pub fn init() {
    TICKS.store(0, Ordering::SeqCst);
}

/// Ticks since boot.
pub fn ticks() -> i64 {
    TICKS.load(Ordering::SeqCst)
}

/// One timer interrupt.
pub fn tick() {
    let now = TICKS.fetch_add(1, Ordering::SeqCst) + 1;

    let old = interrupts::disable();
    interrupts::set_context(true);
    scheduler::tick(now);
    interrupts::set_context(false);
    interrupts::set_level(old);

    if interrupts::take_yield_request() && scheduler::is_started() {
        scheduler::yield_now();
    }
}
