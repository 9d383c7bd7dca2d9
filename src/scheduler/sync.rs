//! Synchronization primitives: counting semaphores, locks with priority
//! donation, and condition variables.
//!
//! Waiter lists are priority-ordered and re-sorted on wake, because
//! donation can move a queued thread's priority under it. A lock acquire
//! walks the chain of lock holders, donating the caller's priority to
//! each, bounded in depth; a cycle in that chain is a kernel deadlock
//! and panics.

use super::thread::{Donation, Thread};
use super::{block_current, current, is_started, unblock, yield_now};
use crate::interrupts;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// How many lock holders a donation may propagate through.
const DONATION_DEPTH_MAX: usize = 8;

struct SemaState {
    value: u32,
    waiters: Vec<Arc<Thread>>,
}

/// Counting semaphore.
pub struct Semaphore {
    state: Mutex<SemaState>,
}

impl Semaphore {
    pub fn new(value: u32) -> Semaphore {
        Semaphore {
            state: Mutex::new(SemaState {
                value,
                waiters: Vec::new(),
            }),
        }
    }

    /// Wait until the value is positive, then take one.
    pub fn down(&self) {
        assert!(!interrupts::in_context(), "cannot block in interrupt context");
        let old = interrupts::disable();
        loop {
            let mut st = self.state.lock();
            if st.value > 0 {
                st.value -= 1;
                break;
            }
            let cur = current();
            let pos = st
                .waiters
                .iter()
                .position(|t| t.priority() < cur.priority())
                .unwrap_or(st.waiters.len());
            st.waiters.insert(pos, cur);
            drop(st);
            block_current();
        }
        interrupts::set_level(old);
    }

    /// Take one only if that needs no waiting.
    pub fn try_down(&self) -> bool {
        interrupts::without_interrupts(|| {
            let mut st = self.state.lock();
            if st.value > 0 {
                st.value -= 1;
                true
            } else {
                false
            }
        })
    }

    /// Add one and wake the highest-priority waiter, yielding to it if
    /// it outranks the caller.
    pub fn up(&self) {
        let old = interrupts::disable();
        let woken = {
            let mut st = self.state.lock();
            let woken = if st.waiters.is_empty() {
                None
            } else {
                // Donations may have reshuffled priorities; re-sort.
                st.waiters.sort_by(|a, b| b.priority().cmp(&a.priority()));
                Some(st.waiters.remove(0))
            };
            st.value += 1;
            woken
        };
        if let Some(t) = &woken {
            unblock(t.clone());
        }
        interrupts::set_level(old);
        if let Some(t) = woken {
            preempt_for(&t);
        }
    }
}

/// Hand the CPU over if `t` outranks the running thread.
fn preempt_for(t: &Arc<Thread>) {
    if !is_started() {
        return;
    }
    if t.priority() > current().priority() {
        if interrupts::in_context() {
            interrupts::yield_on_return();
        } else {
            yield_now();
        }
    }
}

pub(crate) struct LockInner {
    pub(crate) holder: Mutex<Option<Arc<Thread>>>,
    sema: Semaphore,
}

/// A binary lock with priority donation. Handles are cheap clones
/// sharing one lock; at most one thread holds it at a time, and the
/// holder inherits the priority of its highest waiter, transitively
/// through chains of locks.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Lock {
    pub fn new() -> Lock {
        Lock {
            inner: Arc::new(LockInner {
                holder: Mutex::new(None),
                sema: Semaphore::new(1),
            }),
        }
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub fn held_by_current_thread(&self) -> bool {
        let holder = self.inner.holder.lock();
        match holder.as_ref() {
            Some(h) => Arc::ptr_eq(h, &current()),
            None => false,
        }
    }

    /// Acquire the lock, donating our priority down the holder chain
    /// first if we are about to wait.
    pub fn acquire(&self) {
        assert!(!interrupts::in_context(), "cannot block in interrupt context");
        assert!(!self.held_by_current_thread(), "lock is not recursive");
        let cur = current();

        let old = interrupts::disable();
        if self.inner.holder.lock().is_some() {
            *cur.waiting_on.lock() = Some(self.inner.clone());
            self.donate_chain(&cur);
        }
        interrupts::set_level(old);

        self.inner.sema.down();

        let old = interrupts::disable();
        *cur.waiting_on.lock() = None;
        *self.inner.holder.lock() = Some(cur);
        interrupts::set_level(old);
    }

    /// Walk holder → holder.waiting_on → … recording a donation at each
    /// step. Runs with interrupts off.
    fn donate_chain(&self, donor: &Arc<Thread>) {
        let origin = Arc::as_ptr(&self.inner) as usize;
        let mut lock = self.inner.clone();
        for _ in 0..DONATION_DEPTH_MAX {
            let holder = match lock.holder.lock().clone() {
                Some(h) => h,
                None => break,
            };
            if Arc::ptr_eq(&holder, donor) {
                panic!("deadlock: priority donation chain loops back to the donor");
            }
            let lock_id = Arc::as_ptr(&lock) as usize;
            {
                let mut donations = holder.donations.lock();
                match donations
                    .iter_mut()
                    .find(|d| d.donor == donor.tid() && d.lock == lock_id)
                {
                    Some(d) => d.priority = donor.priority(),
                    None => donations.push(Donation {
                        priority: donor.priority(),
                        donor: donor.tid(),
                        lock: lock_id,
                    }),
                }
            }
            holder.refresh_priority();

            let next = holder.waiting_on.lock().clone();
            match next {
                Some(n) => {
                    if Arc::as_ptr(&n) as usize == origin {
                        panic!("deadlock: priority donation chain forms a cycle");
                    }
                    lock = n;
                }
                None => break,
            }
        }
    }

    /// Acquire without waiting; true on success.
    pub fn try_acquire(&self) -> bool {
        assert!(!interrupts::in_context(), "cannot block in interrupt context");
        if self.inner.sema.try_down() {
            *self.inner.holder.lock() = Some(current());
            true
        } else {
            false
        }
    }

    /// Release the lock: strip every donation made on it, recompute our
    /// priority, and wake the highest-priority waiter.
    pub fn release(&self) {
        assert!(self.held_by_current_thread(), "releasing a lock we do not hold");
        let cur = current();
        let old = interrupts::disable();
        let id = self.id();
        cur.donations.lock().retain(|d| d.lock != id);
        cur.refresh_priority();
        *self.inner.holder.lock() = None;
        interrupts::set_level(old);
        self.inner.sema.up();
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

struct CondWaiter {
    thread: Arc<Thread>,
    sema: Arc<Semaphore>,
}

/// Condition variable. Each waiter parks on a private semaphore;
/// `signal` releases the highest-priority waiter.
pub struct Condvar {
    waiters: Mutex<Vec<CondWaiter>>,
}

impl Condvar {
    pub fn new() -> Condvar {
        Condvar {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Atomically release `lock` and wait to be signaled; reacquires
    /// `lock` before returning.
    pub fn wait(&self, lock: &Lock) {
        assert!(!interrupts::in_context(), "cannot block in interrupt context");
        assert!(lock.held_by_current_thread(), "condvar wait without the lock");
        let sema = Arc::new(Semaphore::new(0));
        self.waiters.lock().push(CondWaiter {
            thread: current(),
            sema: sema.clone(),
        });
        lock.release();
        sema.down();
        lock.acquire();
    }

    /// Wake one waiter, if any. The caller must hold `lock`.
    pub fn signal(&self, lock: &Lock) {
        assert!(lock.held_by_current_thread(), "condvar signal without the lock");
        let waiter = {
            let mut ws = self.waiters.lock();
            if ws.is_empty() {
                None
            } else {
                ws.sort_by(|a, b| b.thread.priority().cmp(&a.thread.priority()));
                Some(ws.remove(0))
            }
        };
        if let Some(w) = waiter {
            w.sema.up();
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self, lock: &Lock) {
        while !self.waiters.lock().is_empty() {
            self.signal(lock);
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{self, spawn, PRI_DEFAULT};
    use crate::test_support;
    use alloc::vec::Vec;
    use spin::Mutex as SpinMutex;

    type Trace = Arc<SpinMutex<Vec<&'static str>>>;

    fn trace() -> Trace {
        Arc::new(SpinMutex::new(Vec::new()))
    }

    #[test]
    fn semaphore_ping() {
        let _k = test_support::boot();
        let log = trace();
        let sa = Arc::new(Semaphore::new(0));
        let sb = Arc::new(Semaphore::new(0));
        let (l, a, b) = (log.clone(), sa.clone(), sb.clone());
        spawn("ping", PRI_DEFAULT + 1, move || {
            for _ in 0..3 {
                a.down();
                l.lock().push("a");
                b.up();
            }
        });
        for _ in 0..3 {
            sa.up();
            sb.down();
        }
        assert_eq!(*log.lock(), ["a", "a", "a"]);
    }

    #[test]
    fn try_down_never_blocks() {
        let _k = test_support::boot();
        let sema = Semaphore::new(1);
        assert!(sema.try_down());
        assert!(!sema.try_down());
        sema.up();
        assert!(sema.try_down());
    }

    #[test]
    fn lock_try_acquire() {
        let _k = test_support::boot();
        let lock = Lock::new();
        assert!(lock.try_acquire());
        assert!(lock.held_by_current_thread());
        let l2 = lock.clone();
        spawn("contender", PRI_DEFAULT + 1, move || {
            assert!(!l2.try_acquire());
        });
        lock.release();
        assert!(!lock.held_by_current_thread());
    }

    #[test]
    fn donation_raises_and_restores() {
        let _k = test_support::boot();
        let lock = Lock::new();
        lock.acquire();
        assert_eq!(scheduler::get_priority(), PRI_DEFAULT);
        let l2 = lock.clone();
        let log = trace();
        let l = log.clone();
        spawn("acquirer", PRI_DEFAULT + 9, move || {
            l2.acquire();
            l.lock().push("acquirer got it");
            l2.release();
        });
        // The acquirer ran, blocked on the lock, and donated to us.
        assert_eq!(scheduler::get_priority(), PRI_DEFAULT + 9);
        assert!(log.lock().is_empty());
        lock.release();
        // Releasing dropped our donation and handed the lock over.
        assert_eq!(*log.lock(), ["acquirer got it"]);
        assert_eq!(scheduler::get_priority(), PRI_DEFAULT);
    }

    #[test]
    fn donation_chain_propagates() {
        // H (main, 31) holds L1. M (32) holds L2 and waits on L1.
        // C (40) waits on L2. Donations flow C → M → H.
        let _k = test_support::boot();
        let l1 = Lock::new();
        let l2 = Lock::new();
        l1.acquire();
        let log = trace();

        let (m_l1, m_l2, m_log) = (l1.clone(), l2.clone(), log.clone());
        let m_tid = spawn("m", 32, move || {
            m_l2.acquire();
            m_l1.acquire();
            m_log.lock().push("m got l1");
            m_l1.release();
            m_l2.release();
            m_log.lock().push("m done");
        });
        assert_eq!(scheduler::get_priority(), 32);

        let (c_l2, c_log) = (l2.clone(), log.clone());
        spawn("c", 40, move || {
            c_l2.acquire();
            c_log.lock().push("c got l2");
            c_l2.release();
            c_log.lock().push("c done");
        });

        // Transitive donation: both the middle thread and we sit at 40.
        assert_eq!(scheduler::get_priority(), 40);
        let m = scheduler::thread_by_tid(m_tid).expect("m is alive");
        assert_eq!(m.priority(), 40);

        l1.release();
        // Everyone drained in priority order.
        assert_eq!(
            *log.lock(),
            ["m got l1", "c got l2", "c done", "m done"]
        );
        assert_eq!(scheduler::get_priority(), PRI_DEFAULT);
    }

    #[test]
    fn donations_fall_back_per_lock() {
        let _k = test_support::boot();
        let l1 = Lock::new();
        let l2 = Lock::new();
        l1.acquire();
        l2.acquire();
        let a = l1.clone();
        spawn("a", 40, move || {
            a.acquire();
            a.release();
        });
        let b = l2.clone();
        spawn("b", 45, move || {
            b.acquire();
            b.release();
        });
        assert_eq!(scheduler::get_priority(), 45);
        l2.release();
        // The donation tied to l2 is gone; l1's remains.
        assert_eq!(scheduler::get_priority(), 40);
        l1.release();
        assert_eq!(scheduler::get_priority(), PRI_DEFAULT);
    }

    #[test]
    #[should_panic(expected = "deadlock")]
    fn donation_cycle_panics() {
        let _k = test_support::boot();
        let l1 = Lock::new();
        let l2 = Lock::new();
        l1.acquire();
        let (a1, a2) = (l1.clone(), l2.clone());
        spawn("peer", PRI_DEFAULT + 5, move || {
            a2.acquire();
            a1.acquire(); // blocks: main holds l1
            a1.release();
            a2.release();
        });
        // peer holds l2 and waits on l1 (which we hold); closing the
        // circle must be detected, not deadlock.
        l2.acquire();
    }

    #[test]
    fn condvar_signals_by_priority() {
        let _k = test_support::boot();
        let lock = Lock::new();
        let cond = Arc::new(Condvar::new());
        let log = trace();
        for (name, pri) in [("w35", 35), ("w45", 45), ("w40", 40)] {
            let (l, c, lg) = (lock.clone(), cond.clone(), log.clone());
            spawn(name, pri, move || {
                l.acquire();
                c.wait(&l);
                lg.lock().push(name);
                l.release();
            });
        }
        assert!(log.lock().is_empty());
        for _ in 0..3 {
            lock.acquire();
            cond.signal(&lock);
            lock.release();
        }
        assert_eq!(*log.lock(), ["w45", "w40", "w35"]);
    }

    #[test]
    fn broadcast_wakes_everyone() {
        let _k = test_support::boot();
        let lock = Lock::new();
        let cond = Arc::new(Condvar::new());
        let done = Arc::new(Semaphore::new(0));
        for i in 0..3 {
            let (l, c, d) = (lock.clone(), cond.clone(), done.clone());
            spawn("waiter", 40 + i, move || {
                l.acquire();
                c.wait(&l);
                l.release();
                d.up();
            });
        }
        lock.acquire();
        cond.broadcast(&lock);
        lock.release();
        for _ in 0..3 {
            done.down();
        }
    }
}
