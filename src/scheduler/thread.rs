//! The thread control block.

use super::context::Context;
use super::sync::LockInner;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use spin::Mutex;

use super::fixed_point::Real;

/// Thread identifier.
pub type Tid = i32;

/// Returned when thread creation fails.
pub const TID_ERROR: Tid = -1;

pub const PRI_MIN: i32 = 0;
pub const PRI_DEFAULT: i32 = 31;
pub const PRI_MAX: i32 = 63;

pub const NICE_MIN: i32 = -20;
pub const NICE_DEFAULT: i32 = 0;
pub const NICE_MAX: i32 = 20;

/// Thread names are truncated to this many bytes.
pub const NAME_MAX: usize = 16;

/// Detects clobbered thread structures.
const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    Ready = 0,
    Running = 1,
    Blocked = 2,
    Dying = 3,
}

impl ThreadStatus {
    fn from_u8(v: u8) -> ThreadStatus {
        match v {
            0 => ThreadStatus::Ready,
            1 => ThreadStatus::Running,
            2 => ThreadStatus::Blocked,
            3 => ThreadStatus::Dying,
            _ => unreachable!("invalid thread status"),
        }
    }
}

/// One recorded priority donation: `donor` raised the owning thread's
/// priority to `priority` while waiting on `lock`.
pub(crate) struct Donation {
    pub priority: i32,
    pub donor: Tid,
    pub lock: usize,
}

/// A kernel thread. Shared as `Arc<Thread>` between the ready queue, the
/// all-threads registry, waiter lists, donations and frame ownership;
/// mutable scheduling state is atomic, the rest sits behind short-lived
/// spin locks.
pub struct Thread {
    tid: AtomicI32,
    name: String,
    magic: u32,
    pub(crate) is_idle: bool,
    status: AtomicU8,
    base_priority: AtomicI32,
    priority: AtomicI32,
    nice: AtomicI32,
    recent_cpu: AtomicI32,
    pub(crate) donations: Mutex<Vec<Donation>>,
    pub(crate) waiting_on: Mutex<Option<Arc<LockInner>>>,
    pub(crate) entry: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    pub(crate) context: Context,
    pub(crate) pcb: Mutex<Option<Arc<crate::process::Pcb>>>,
    pub(crate) children: Mutex<Vec<Arc<crate::process::Pcb>>>,
    pub(crate) user: Mutex<Option<crate::process::UserState>>,
    #[cfg(target_os = "none")]
    pub(crate) stack: Option<x86_64::VirtAddr>,
}

// The register cell (bare metal) is only touched by whichever CPU-side
// owns the thread at that instant, under the scheduler's interrupts-off
// discipline.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    pub(crate) fn new(
        name: &str,
        priority: i32,
        is_idle: bool,
        context: Context,
        #[cfg(target_os = "none")] stack: Option<x86_64::VirtAddr>,
    ) -> Thread {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority), "priority {} out of range", priority);
        let mut truncated = String::from(name);
        truncated.truncate(NAME_MAX);
        Thread {
            tid: AtomicI32::new(TID_ERROR),
            name: truncated,
            magic: THREAD_MAGIC,
            is_idle,
            status: AtomicU8::new(ThreadStatus::Blocked as u8),
            base_priority: AtomicI32::new(priority),
            priority: AtomicI32::new(priority),
            nice: AtomicI32::new(NICE_DEFAULT),
            recent_cpu: AtomicI32::new(0),
            donations: Mutex::new(Vec::new()),
            waiting_on: Mutex::new(None),
            entry: Mutex::new(None),
            context,
            pcb: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            user: Mutex::new(None),
            #[cfg(target_os = "none")]
            stack,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid.load(Ordering::SeqCst)
    }

    pub(crate) fn set_tid(&self, tid: Tid) {
        self.tid.store(tid, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Effective priority: the base plus whatever has been donated.
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::SeqCst)
    }

    pub fn base_priority(&self) -> i32 {
        self.base_priority.load(Ordering::SeqCst)
    }

    pub(crate) fn set_base_priority(&self, priority: i32) {
        self.base_priority.store(priority, Ordering::SeqCst);
    }

    /// Overwrite the effective priority directly; MLFQS owns priorities
    /// and donation is idle there.
    pub(crate) fn set_priority_raw(&self, priority: i32) {
        self.priority.store(priority, Ordering::SeqCst);
    }

    /// Recompute the effective priority as the maximum of the base
    /// priority and all live donations.
    pub(crate) fn refresh_priority(&self) {
        let donated = self
            .donations
            .lock()
            .iter()
            .map(|d| d.priority)
            .max()
            .unwrap_or(PRI_MIN);
        let base = self.base_priority();
        self.priority.store(base.max(donated), Ordering::SeqCst);
    }

    pub fn nice(&self) -> i32 {
        self.nice.load(Ordering::SeqCst)
    }

    pub(crate) fn set_nice_raw(&self, nice: i32) {
        self.nice.store(nice, Ordering::SeqCst);
    }

    pub(crate) fn recent_cpu(&self) -> Real {
        Real::from_bits(self.recent_cpu.load(Ordering::SeqCst))
    }

    pub(crate) fn set_recent_cpu(&self, value: Real) {
        self.recent_cpu.store(value.to_bits(), Ordering::SeqCst);
    }

    pub(crate) fn check_magic(&self) {
        assert_eq!(self.magic, THREAD_MAGIC, "thread structure corrupted");
    }
}

#[cfg(target_os = "none")]
impl Drop for Thread {
    fn drop(&mut self) {
        if let Some(stack) = self.stack.take() {
            crate::memory::palloc::free_page(stack);
        }
    }
}
