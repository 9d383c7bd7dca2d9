//! Kernel threads: state machine, ready queue, policies.
//!
//! Two policies share this engine. The default is round-robin over a
//! strictly priority-ordered ready queue with priority inheritance from
//! `sync`, preempting every `TIME_SLICE` ticks, with optional aging of
//! ready threads. The alternative is the 4.4BSD multilevel feedback
//! queue driven by `recent_cpu`, `nice` and the system `load_avg`.
//!
//! All scheduling state lives in one `SchedState` behind a single lock,
//! mutated with interrupts masked; the lock is never held across a
//! context switch.

pub mod context;
pub mod fixed_point;
pub mod sync;
pub mod thread;

use crate::drivers::timer::TIMER_FREQ;
use crate::interrupts;
use crate::KernelConfig;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use context::Context;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use fixed_point::Real;
use lazy_static::lazy_static;
use spin::{Mutex, MutexGuard};
pub use thread::{
    Thread, ThreadStatus, Tid, NICE_DEFAULT, NICE_MAX, NICE_MIN, PRI_DEFAULT, PRI_MAX, PRI_MIN,
    TID_ERROR,
};

/// Ticks each thread gets before preemption.
pub const TIME_SLICE: u32 = 4;

struct SchedState {
    /// Priority-ordered, FIFO among equals. Every READY non-idle thread
    /// appears here exactly once.
    ready: VecDeque<Arc<Thread>>,
    /// Every live thread that has been scheduled, idle included.
    all: Vec<Arc<Thread>>,
    current: Option<Arc<Thread>>,
    idle: Option<Arc<Thread>>,
    /// A thread that died on its own stack; the next thread to run drops
    /// the last reference in `schedule_tail`.
    prev_dying: Option<Arc<Thread>>,
    /// READY-or-RUNNING threads, idle excluded.
    ready_threads: i32,
    load_avg: Real,
    /// Ticks in the current time slice.
    slice_ticks: u32,
    /// Ticks toward the next MLFQS priority sweep.
    mlfqs_slice: u32,
}

impl SchedState {
    fn new() -> SchedState {
        SchedState {
            ready: VecDeque::new(),
            all: Vec::new(),
            current: None,
            idle: None,
            prev_dying: None,
            ready_threads: 0,
            load_avg: Real::ZERO,
            slice_ticks: 0,
            mlfqs_slice: 0,
        }
    }
}

lazy_static! {
    static ref SCHED: Mutex<SchedState> = Mutex::new(SchedState::new());
    static ref TID_LOCK: sync::Lock = sync::Lock::new();
}

static STARTED: AtomicBool = AtomicBool::new(false);
static MLFQS: AtomicBool = AtomicBool::new(false);
static AGING: AtomicBool = AtomicBool::new(false);
static NEXT_TID: AtomicI32 = AtomicI32::new(1);

static IDLE_TICKS: AtomicI64 = AtomicI64::new(0);
static KERNEL_TICKS: AtomicI64 = AtomicI64::new(0);
static USER_TICKS: AtomicI64 = AtomicI64::new(0);

/// Tick counters by kind, in the shape of the boot-exit statistics line.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub idle_ticks: i64,
    pub kernel_ticks: i64,
    pub user_ticks: i64,
}

/// Turn the running code into the initial thread and reset the engine.
pub fn init(config: &KernelConfig) {
    MLFQS.store(config.mlfqs, Ordering::SeqCst);
    AGING.store(config.aging && !config.mlfqs, Ordering::SeqCst);
    STARTED.store(false, Ordering::SeqCst);
    IDLE_TICKS.store(0, Ordering::SeqCst);
    KERNEL_TICKS.store(0, Ordering::SeqCst);
    USER_TICKS.store(0, Ordering::SeqCst);

    // The initial thread runs on the boot stack, which was not taken
    // from the kernel pool.
    #[cfg(target_os = "none")]
    let main = Arc::new(Thread::new("main", PRI_DEFAULT, false, Context::empty(), None));
    #[cfg(not(target_os = "none"))]
    let main = Arc::new(Thread::new("main", PRI_DEFAULT, false, Context::empty()));
    main.set_status(ThreadStatus::Running);

    let old = interrupts::disable();
    {
        let mut s = SCHED.lock();
        *s = SchedState::new();
        s.all.push(main.clone());
        s.current = Some(main.clone());
        s.ready_threads = 1;
    }
    interrupts::set_level(old);

    // Safe now that `current` exists: tid allocation takes a lock.
    main.set_tid(allocate_tid());
}

/// Create the idle thread and open the preemption floodgates.
pub fn start() {
    let idle = new_thread_shell("idle", PRI_MIN, true);
    *idle.entry.lock() = Some(Box::new(idle_loop));
    idle.set_tid(allocate_tid());
    #[cfg(not(target_os = "none"))]
    assert!(attach_host_thread(&idle), "failed to start the idle thread");

    interrupts::without_interrupts(|| {
        let mut s = SCHED.lock();
        s.all.push(idle.clone());
        s.idle = Some(idle);
    });

    STARTED.store(true, Ordering::SeqCst);
    interrupts::enable();
}

pub fn is_started() -> bool {
    STARTED.load(Ordering::SeqCst)
}

pub fn is_mlfqs() -> bool {
    MLFQS.load(Ordering::SeqCst)
}

fn allocate_tid() -> Tid {
    TID_LOCK.acquire();
    let tid = NEXT_TID.fetch_add(1, Ordering::SeqCst);
    TID_LOCK.release();
    tid
}

/// The running thread.
pub fn current() -> Arc<Thread> {
    let cur = SCHED
        .lock()
        .current
        .clone()
        .expect("thread system not initialized");
    cur.check_magic();
    cur
}

/// Look a live thread up by tid.
pub fn thread_by_tid(tid: Tid) -> Option<Arc<Thread>> {
    SCHED.lock().all.iter().find(|t| t.tid() == tid).cloned()
}

/// Spawn a kernel thread running `f`. Returns its tid, or `TID_ERROR`
/// if the stack allocation fails. If the new thread outranks the
/// creator, the creator yields at once.
pub fn spawn(name: &str, priority: i32, f: impl FnOnce() + Send + 'static) -> Tid {
    spawn_inner(name, priority, None, Box::new(f))
}

/// As `spawn`, but the new thread carries a process control block that
/// is also linked into the creator's children. Used by `process`.
pub(crate) fn spawn_with_pcb(
    name: &str,
    priority: i32,
    pcb: Arc<crate::process::Pcb>,
    f: Box<dyn FnOnce() + Send>,
) -> Tid {
    spawn_inner(name, priority, Some(pcb), f)
}

fn spawn_inner(
    name: &str,
    priority: i32,
    pcb: Option<Arc<crate::process::Pcb>>,
    f: Box<dyn FnOnce() + Send>,
) -> Tid {
    let creator = current();

    let t = match new_kernel_thread(name, priority) {
        Some(t) => t,
        None => return TID_ERROR,
    };
    t.set_nice_raw(creator.nice());
    t.set_recent_cpu(creator.recent_cpu());
    *t.entry.lock() = Some(f);

    let tid = allocate_tid();
    t.set_tid(tid);
    if let Some(pcb) = pcb {
        pcb.set_pid(tid);
        *t.pcb.lock() = Some(pcb.clone());
        creator.children.lock().push(pcb);
    }

    interrupts::without_interrupts(|| SCHED.lock().all.push(t.clone()));

    #[cfg(not(target_os = "none"))]
    if !attach_host_thread(&t) {
        interrupts::without_interrupts(|| {
            SCHED.lock().all.retain(|x| !Arc::ptr_eq(x, &t));
        });
        if let Some(pcb) = t.pcb.lock().take() {
            creator.children.lock().retain(|c| !Arc::ptr_eq(c, &pcb));
        }
        return TID_ERROR;
    }

    unblock(t.clone());

    if is_started() && creator.priority() < t.priority() {
        yield_now();
    }
    tid
}

/// Build a blocked thread with a fresh context (and, on bare metal, a
/// kernel stack page with a sentinel at its base).
fn new_thread_shell(name: &str, priority: i32, is_idle: bool) -> Arc<Thread> {
    #[cfg(target_os = "none")]
    {
        use crate::memory::palloc::{self, PalFlags};
        use crate::memory::PGSIZE;
        let stack = palloc::get_page(PalFlags::ZERO).expect("out of kernel pool pages");
        unsafe { (stack.as_u64() as *mut u32).write(STACK_SENTINEL) };
        let ctx = Context::fresh(
            kernel_thread_trampoline as usize as u64,
            stack.as_u64() + PGSIZE as u64,
        );
        return Arc::new(Thread::new(name, priority, is_idle, ctx, Some(stack)));
    }
    #[cfg(not(target_os = "none"))]
    {
        return Arc::new(Thread::new(name, priority, is_idle, Context::empty()));
    }
}

fn new_kernel_thread(name: &str, priority: i32) -> Option<Arc<Thread>> {
    #[cfg(target_os = "none")]
    {
        use crate::memory::palloc::{self, PalFlags};
        use crate::memory::PGSIZE;
        let stack = palloc::get_page(PalFlags::ZERO)?;
        unsafe { (stack.as_u64() as *mut u32).write(STACK_SENTINEL) };
        let ctx = Context::fresh(
            kernel_thread_trampoline as usize as u64,
            stack.as_u64() + PGSIZE as u64,
        );
        return Some(Arc::new(Thread::new(name, priority, false, ctx, Some(stack))));
    }
    #[cfg(not(target_os = "none"))]
    {
        return Some(Arc::new(Thread::new(name, priority, false, Context::empty())));
    }
}

#[cfg(target_os = "none")]
const STACK_SENTINEL: u32 = 0x5ca1_ab1e;

/// Hosted backend: give the thread an OS thread that waits to be
/// scheduled for the first time.
#[cfg(not(target_os = "none"))]
fn attach_host_thread(t: &Arc<Thread>) -> bool {
    let t2 = t.clone();
    std::thread::Builder::new()
        .name(alloc::string::String::from(t.name()))
        .spawn(move || {
            t2.context.park();
            drop(t2);
            kernel_thread_entry();
        })
        .is_ok()
}

#[cfg(target_os = "none")]
extern "C" fn kernel_thread_trampoline() -> ! {
    kernel_thread_entry()
}

/// First code every thread runs: finish the switch, enable interrupts,
/// call the entry function, and exit if it returns.
fn kernel_thread_entry() -> ! {
    schedule_tail();
    interrupts::enable();
    let f = current()
        .entry
        .lock()
        .take()
        .expect("thread has no entry function");
    f();
    crate::process::exit(0)
}

/// Holds the CPU when nothing is ready. Never on the ready queue; the
/// scheduler hands it the CPU directly when the queue is empty.
fn idle_loop() {
    loop {
        interrupts::disable();
        block_current();
        interrupts::wait();
    }
}

/// Park the running thread. Interrupts must be off; somebody else must
/// eventually `unblock` it.
pub fn block_current() {
    assert!(!interrupts::in_context(), "cannot block in interrupt context");
    assert_eq!(interrupts::get_level(), interrupts::IntrLevel::Off);
    let mut s = SCHED.lock();
    let cur = s.current.clone().expect("no running thread");
    cur.set_status(ThreadStatus::Blocked);
    if !cur.is_idle {
        s.ready_threads -= 1;
    }
    drop(cur);
    schedule(s);
}

/// Move a blocked thread to the ready queue, priority-ordered. Does not
/// preempt: callers that need preemption yield themselves, which keeps
/// unblock-then-update sequences atomic for synchronization primitives.
pub fn unblock(t: Arc<Thread>) {
    let old = interrupts::disable();
    assert_eq!(t.status(), ThreadStatus::Blocked, "unblocking a non-blocked thread");
    let mut s = SCHED.lock();
    insert_ready(&mut s, t.clone());
    t.set_status(ThreadStatus::Ready);
    if !t.is_idle {
        s.ready_threads += 1;
    }
    drop(s);
    interrupts::set_level(old);
}

/// Give up the CPU; the caller stays ready and may be rescheduled
/// immediately.
pub fn yield_now() {
    assert!(!interrupts::in_context(), "cannot yield in interrupt context");
    let old = interrupts::disable();
    let mut s = SCHED.lock();
    let cur = s.current.clone().expect("no running thread");
    if !cur.is_idle {
        insert_ready(&mut s, cur.clone());
    }
    cur.set_status(ThreadStatus::Ready);
    drop(cur);
    schedule(s);
    interrupts::set_level(old);
}

/// Deschedule and destroy the running thread. The next thread to run
/// reclaims the corpse in `schedule_tail`.
pub(crate) fn exit_current() -> ! {
    assert!(!interrupts::in_context(), "cannot exit in interrupt context");
    interrupts::disable();
    let mut s = SCHED.lock();
    let cur = s.current.clone().expect("no running thread");
    s.all.retain(|t| !Arc::ptr_eq(t, &cur));
    cur.set_status(ThreadStatus::Dying);
    if !cur.is_idle {
        s.ready_threads -= 1;
    }
    drop(cur);
    schedule(s);
    unreachable!("dying thread was rescheduled");
}

fn insert_ready(s: &mut SchedState, t: Arc<Thread>) {
    let pos = s
        .ready
        .iter()
        .position(|x| x.priority() < t.priority())
        .unwrap_or(s.ready.len());
    s.ready.insert(pos, t);
}

/// Pick the next thread and switch to it. Interrupts must be off and the
/// current thread must already be in its target state; the scheduler
/// lock is consumed and released before the switch itself.
fn schedule(mut s: MutexGuard<'static, SchedState>) {
    assert_eq!(interrupts::get_level(), interrupts::IntrLevel::Off);
    let prev = s.current.take().expect("schedule without a current thread");
    assert_ne!(prev.status(), ThreadStatus::Running);
    prev.check_magic();
    #[cfg(target_os = "none")]
    check_stack_sentinel(&prev);

    // Donations may have moved priorities since insertion; re-sort.
    // The sort is stable, so equal priorities keep FIFO order.
    s.ready
        .make_contiguous()
        .sort_by(|a, b| b.priority().cmp(&a.priority()));
    let next = match s.ready.pop_front() {
        Some(t) => t,
        None => s.idle.clone().expect("ready queue empty and no idle thread"),
    };
    next.check_magic();
    next.set_status(ThreadStatus::Running);
    s.slice_ticks = 0;
    s.current = Some(next.clone());

    if Arc::ptr_eq(&prev, &next) {
        return;
    }

    let dying = prev.status() == ThreadStatus::Dying;

    #[cfg(target_os = "none")]
    {
        let prev_regs = prev.context.regs_ptr();
        let next_regs = next.context.regs_ptr();
        if dying {
            s.prev_dying = Some(prev);
            drop(next);
            drop(s);
            unsafe { context::jump_registers(next_regs) }
        } else {
            drop(next);
            drop(s);
            unsafe { context::switch_registers(prev_regs, next_regs) };
            schedule_tail();
        }
    }

    #[cfg(not(target_os = "none"))]
    {
        if dying {
            s.prev_dying = Some(prev.clone());
            drop(s);
            next.context.unpark();
            loop {
                prev.context.park();
            }
        } else {
            drop(s);
            next.context.unpark();
            prev.context.park();
            schedule_tail();
        }
    }
}

/// Runs in the incoming thread right after a switch: drop the previous
/// thread if it was dying (its stack cannot be freed from under it).
fn schedule_tail() {
    let dead = SCHED.lock().prev_dying.take();
    drop(dead);
}

#[cfg(target_os = "none")]
fn check_stack_sentinel(t: &Arc<Thread>) {
    if let Some(stack) = t.stack {
        let sentinel = unsafe { (stack.as_u64() as *const u32).read() };
        assert_eq!(sentinel, STACK_SENTINEL, "kernel stack overflow in '{}'", t.name());
    }
}

/// Timer-tick accounting; runs in interrupt context. Statistics first,
/// then policy updates, then the preemption request.
pub(crate) fn tick(now: i64) {
    let cur = {
        let s = SCHED.lock();
        match &s.current {
            Some(c) => c.clone(),
            None => return,
        }
    };

    if cur.is_idle {
        IDLE_TICKS.fetch_add(1, Ordering::SeqCst);
    } else {
        // try_lock: the interrupted thread may hold its own user state.
        let is_user = cur
            .user
            .try_lock()
            .map(|u| u.is_some())
            .unwrap_or(false);
        if is_user {
            USER_TICKS.fetch_add(1, Ordering::SeqCst);
        } else {
            KERNEL_TICKS.fetch_add(1, Ordering::SeqCst);
        }
    }

    if MLFQS.load(Ordering::SeqCst) {
        if !cur.is_idle {
            cur.set_recent_cpu(cur.recent_cpu().add_int(1));
        }
        if now % TIMER_FREQ as i64 == 0 {
            update_load_avg();
            update_recent_cpu_all();
        }
        let sweep = {
            let mut s = SCHED.lock();
            s.mlfqs_slice += 1;
            if s.mlfqs_slice >= TIME_SLICE {
                s.mlfqs_slice = 0;
                true
            } else {
                false
            }
        };
        if sweep {
            update_priorities_all(&cur);
        }
    } else if AGING.load(Ordering::SeqCst) {
        age_ready_threads();
    }

    let mut s = SCHED.lock();
    s.slice_ticks += 1;
    if s.slice_ticks >= TIME_SLICE {
        interrupts::yield_on_return();
    }
}

/// `load_avg := (59/60)·load_avg + (1/60)·ready_threads`, once a second.
fn update_load_avg() {
    let mut s = SCHED.lock();
    let ready = s.ready_threads;
    s.load_avg =
        Real::from_int(59).div_int(60) * s.load_avg + Real::from_int(1).div_int(60).mul_int(ready);
}

/// `recent_cpu := (2·load)/(2·load + 1)·recent_cpu + nice` for every
/// thread but idle.
fn update_recent_cpu_all() {
    let (all, load) = {
        let s = SCHED.lock();
        (s.all.clone(), s.load_avg)
    };
    for t in &all {
        if t.is_idle {
            continue;
        }
        t.set_recent_cpu(recent_cpu_decay(load, t.recent_cpu(), t.nice()));
    }
}

pub(crate) fn recent_cpu_decay(load_avg: Real, recent_cpu: Real, nice: i32) -> Real {
    let twice = load_avg.mul_int(2);
    let coef = twice / twice.add_int(1);
    (coef * recent_cpu).add_int(nice)
}

/// `priority := PRI_MAX - recent_cpu/4 - nice·2`, clamped.
pub(crate) fn calculate_priority(recent_cpu: Real, nice: i32) -> i32 {
    let p = Real::from_int(PRI_MAX) - recent_cpu.div_int(4) - Real::from_int(nice * 2);
    p.to_int().clamp(PRI_MIN, PRI_MAX)
}

fn update_priorities_all(cur: &Arc<Thread>) {
    let all = { SCHED.lock().all.clone() };
    let mut max_priority = PRI_MIN;
    for t in &all {
        if t.is_idle {
            continue;
        }
        let p = calculate_priority(t.recent_cpu(), t.nice());
        t.set_base_priority(p);
        t.set_priority_raw(p);
        max_priority = max_priority.max(p);
    }
    if cur.priority() < max_priority {
        interrupts::yield_on_return();
    }
}

/// Anti-starvation mode: every ready thread creeps up one priority per
/// tick, capped at `PRI_MAX` so the range invariant holds.
fn age_ready_threads() {
    let s = SCHED.lock();
    for t in s.ready.iter() {
        t.set_base_priority((t.base_priority() + 1).min(PRI_MAX));
        t.refresh_priority();
    }
}

/// Set the running thread's base priority; yields if some ready thread
/// now outranks it. Values outside the priority range are rejected.
pub fn set_priority(new_priority: i32) {
    assert!(
        (PRI_MIN..=PRI_MAX).contains(&new_priority),
        "priority {} out of range",
        new_priority
    );
    let cur = current();
    cur.set_base_priority(new_priority);
    cur.refresh_priority();
    maybe_yield_to_ready(&cur);
}

pub fn get_priority() -> i32 {
    current().priority()
}

/// Set the running thread's nice value and recompute its priority
/// (MLFQS only).
pub fn set_nice(nice: i32) {
    assert!(is_mlfqs(), "nice is an MLFQS knob");
    assert!((NICE_MIN..=NICE_MAX).contains(&nice), "nice {} out of range", nice);
    let cur = current();
    if cur.is_idle {
        return;
    }
    cur.set_nice_raw(nice);
    let p = calculate_priority(cur.recent_cpu(), nice);
    cur.set_base_priority(p);
    cur.set_priority_raw(p);
    maybe_yield_to_ready(&cur);
}

pub fn get_nice() -> i32 {
    current().nice()
}

/// 100 times the system load average, rounded.
pub fn load_avg_x100() -> i32 {
    let load = SCHED.lock().load_avg;
    load.mul_int(100).to_int()
}

/// 100 times the running thread's `recent_cpu`, rounded.
pub fn recent_cpu_x100() -> i32 {
    current().recent_cpu().mul_int(100).to_int()
}

fn maybe_yield_to_ready(cur: &Arc<Thread>) {
    if cur.is_idle {
        return;
    }
    let top = { SCHED.lock().ready.iter().map(|t| t.priority()).max() };
    if let Some(top) = top {
        if cur.priority() < top {
            yield_now();
        }
    }
}

/// Apply `f` to every live thread, idle included.
pub fn foreach(mut f: impl FnMut(&Arc<Thread>)) {
    let all = interrupts::without_interrupts(|| SCHED.lock().all.clone());
    for t in &all {
        f(t);
    }
}

pub fn stats() -> Stats {
    Stats {
        idle_ticks: IDLE_TICKS.load(Ordering::SeqCst),
        kernel_ticks: KERNEL_TICKS.load(Ordering::SeqCst),
        user_ticks: USER_TICKS.load(Ordering::SeqCst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::timer;
    use crate::test_support;
    use alloc::vec::Vec;
    use spin::Mutex as SpinMutex;

    type Trace = Arc<SpinMutex<Vec<&'static str>>>;

    fn trace() -> Trace {
        Arc::new(SpinMutex::new(Vec::new()))
    }

    #[test]
    fn lower_priority_spawn_waits_its_turn() {
        let _k = test_support::boot();
        let log = trace();
        let l = log.clone();
        spawn("low", PRI_DEFAULT - 1, move || {
            l.lock().push("low");
        });
        log.lock().push("main");
        yield_now(); // still outranks "low"; nothing should run yet
        set_priority(PRI_DEFAULT - 2); // now "low" outranks us and runs
        assert_eq!(*log.lock(), ["main", "low"]);
        set_priority(PRI_DEFAULT);
    }

    #[test]
    fn higher_priority_spawn_preempts_creator() {
        let _k = test_support::boot();
        let log = trace();
        let l = log.clone();
        spawn("high", PRI_DEFAULT + 1, move || {
            l.lock().push("high");
        });
        log.lock().push("main");
        assert_eq!(*log.lock(), ["high", "main"]);
    }

    #[test]
    fn equal_priorities_run_fifo() {
        let _k = test_support::boot();
        let log = trace();
        for name in ["a", "b", "c"] {
            let l = log.clone();
            spawn(name, PRI_DEFAULT, move || {
                l.lock().push(name);
            });
        }
        // Equal priority: nobody ran yet. One yield lets all three run
        // ahead of us in creation order.
        assert!(log.lock().is_empty());
        yield_now();
        assert_eq!(*log.lock(), ["a", "b", "c"]);
    }

    #[test]
    fn blocked_threads_wake_by_priority() {
        let _k = test_support::boot();
        let log = trace();
        let sema = Arc::new(sync::Semaphore::new(0));
        // All three outrank main, so each runs at spawn and parks on the
        // semaphore in arrival order mid, high, low.
        for (name, pri) in [("mid", 40), ("high", 50), ("low", 35)] {
            let l = log.clone();
            let s = sema.clone();
            spawn(name, pri, move || {
                s.down();
                l.lock().push(name);
            });
        }
        assert!(log.lock().is_empty());
        sema.up();
        sema.up();
        sema.up();
        assert_eq!(*log.lock(), ["high", "mid", "low"]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn set_priority_rejects_out_of_range() {
        let _k = test_support::boot();
        set_priority(PRI_MAX + 1);
    }

    #[test]
    fn aging_raises_waiting_threads() {
        let cfg = crate::KernelConfig {
            mlfqs: false,
            aging: true,
        };
        let _k = test_support::boot_with(cfg, 32, 32);
        let tid = spawn("patient", PRI_MIN, || {});
        let t = thread_by_tid(tid).unwrap();
        assert_eq!(t.priority(), PRI_MIN);
        for _ in 0..10 {
            timer::tick();
        }
        assert_eq!(t.priority(), PRI_MIN + 10);
        // Let it run to completion so the kernel is quiescent.
        set_priority(PRI_MIN);
        set_priority(PRI_DEFAULT);
    }

    #[test]
    fn mlfqs_accounting_moves_with_ticks() {
        let cfg = crate::KernelConfig {
            mlfqs: true,
            aging: false,
        };
        let _k = test_support::boot_with(cfg, 32, 32);
        assert_eq!(load_avg_x100(), 0);
        for _ in 0..(TIMER_FREQ as usize) {
            timer::tick();
        }
        // One CPU-bound thread: load average heads toward 1/60.
        let load = load_avg_x100();
        assert!(load >= 1 && load <= 5, "load_avg_x100 = {}", load);
        assert!(recent_cpu_x100() > 0);
        // Priority was recomputed and stays near the top for a thread
        // with so little accumulated CPU.
        let p = get_priority();
        assert!(p > PRI_DEFAULT && p <= PRI_MAX, "priority = {}", p);
    }

    #[test]
    fn mlfqs_niceness_converges() {
        // Formula-level run of two CPU-bound threads, nice 0 and 20,
        // over two simulated seconds.
        let mut load = Real::ZERO;
        let mut rc = [Real::ZERO, Real::ZERO];
        let nice = [0, 20];
        let mut pri = [PRI_MAX, PRI_MAX];
        for now in 1..=(2 * TIMER_FREQ as i64) {
            // The better-priority thread runs this tick (ties to 0).
            let running = if pri[0] >= pri[1] { 0 } else { 1 };
            rc[running] = rc[running].add_int(1);
            if now % TIMER_FREQ as i64 == 0 {
                load = Real::from_int(59).div_int(60) * load
                    + Real::from_int(1).div_int(60).mul_int(2);
                for i in 0..2 {
                    rc[i] = recent_cpu_decay(load, rc[i], nice[i]);
                }
            }
            if now % TIME_SLICE as i64 == 0 {
                for i in 0..2 {
                    pri[i] = calculate_priority(rc[i], nice[i]);
                }
            }
        }
        assert!(pri[0] >= pri[1], "nice 0 ended below nice 20: {:?}", pri);
        for p in pri {
            assert!((PRI_MIN..=PRI_MAX).contains(&p));
        }
    }

    #[test]
    fn foreach_sees_all_threads() {
        let _k = test_support::boot();
        let sema = Arc::new(sync::Semaphore::new(0));
        let s2 = sema.clone();
        let tid = spawn("sleeper", PRI_DEFAULT - 1, move || s2.down());
        let mut tids = Vec::new();
        foreach(|t| tids.push(t.tid()));
        assert!(tids.contains(&current().tid()));
        assert!(tids.contains(&tid));
        sema.up();
        set_priority(PRI_MIN);
        set_priority(PRI_DEFAULT);
    }
}
