/*
 * Preemptive Multilevel-Feedback Scheduler
 *
 * This module drives every core of the machine between kernel threads. It
 * provides full multitasking with automatic context switching via the
 * one-shot alarm, plus the blocking primitives the rest of the kernel is
 * built on (sleep_releasing / wakeup, and condition variables on top).
 *
 * SCHEDULING MODEL:
 * ================
 *
 * Multilevel feedback queues, one per priority level 0..PRIORITY_QUEUES.
 * Higher levels are served first; new threads enter at the top. A thread's
 * level drifts according to why it last yielded:
 *
 * - Quantum expired      -> one level down (CPU hogs sink)
 * - Blocked on I/O       -> one level up (interactive threads rise)
 * - Lock contention twice in a row -> one level down, letting the holder run
 * - Cooperative yield    -> back to level 0
 *
 * Every YIELDS yields, each queued thread is raised one level and requeued,
 * so nothing starves at the bottom.
 *
 * LOCKING:
 * =======
 *
 * A single scheduler spinlock serializes the queues, every TCB state field,
 * the timeout list and all condvar wait lists. It is only ever taken with
 * preemption disabled (the non-preemptive domain); the alarm path enters the
 * scheduler through yield_cpu like everybody else, so the lock can never be
 * taken recursively. The active-thread counter has its own lock because it
 * is touched outside scheduler-lock regions.
 *
 * CONTEXT SWITCH PROTOCOL:
 * =======================
 *
 * yield_cpu picks the next thread under the lock, records the outgoing
 * thread as the core's `previous`, releases the lock and swaps contexts.
 * The first thing any thread does on gaining the CPU (via yield_cpu's
 * return path or via thread_start for a first run) is call gain(), which
 * finishes the handover: mark itself Running/Dirty, and dispose of the
 * previous thread: requeue it, reclaim it if it exited, or leave it for
 * whoever parked it. Reclamation happens here, one switch after the exit,
 * because only then is the dead thread guaranteed to be off its own stack.
 *
 * The Clean/Dirty phase bit closes the remaining gap: a thread that marks
 * itself Stopped and is signalled before it finishes switching away is made
 * Ready but NOT enqueued (its context is still Dirty); it simply keeps its
 * core, and select_next hands it back.
 */

pub mod condvar;
pub mod thread;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::machine::{self, MAX_CORES, context::CpuContext};
use crate::proc::Pid;

pub use condvar::CondVar;
pub use thread::{CtxPhase, SchedCause, Tcb, ThreadKind, ThreadState, Tid};

/// Number of priority levels.
pub const PRIORITY_QUEUES: usize = 10;

/// Yields between anti-starvation boosts.
pub const YIELDS: usize = 50;

/// Nominal timeslice in milliseconds.
pub const QUANTUM_MS: u64 = 10;

/// Per-core scheduler state.
struct CoreCcb {
    /// Thread currently executing on this core.
    current: Tid,
    /// Thread this core most recently switched away from; disposed of in
    /// the gain phase of the thread that replaced it.
    previous: Tid,
    /// This core's idle thread.
    idle: Tid,
}

struct Sched {
    /// Every live TCB, boxed so context addresses survive map mutation.
    threads: BTreeMap<Tid, Box<Tcb>>,
    /// Ready queues, one per priority level.
    run_queues: [VecDeque<Tid>; PRIORITY_QUEUES],
    /// Stopped threads with a wakeup deadline, ascending by deadline.
    timeout_list: VecDeque<Tid>,
    cores: [Option<CoreCcb>; MAX_CORES],
    next_tid: usize,
    yield_calls: usize,
}

static SCHED: Mutex<Option<Sched>> = Mutex::new(None);

/// Count of existing normal threads. Idle threads do not count. Guarded by
/// its own lock because it is read and written outside scheduler regions;
/// accessed with the alarm masked so the lock is never held across a switch.
static ACTIVE_THREADS: Mutex<usize> = Mutex::new(0);

fn active_threads_adjust(delta: isize) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut count = ACTIVE_THREADS.lock();
        *count = count.checked_add_signed(delta).expect("active thread count underflow");
    });
}

/// Gates alarm preemption until run_scheduler has set up this core.
static SCHED_STARTED: AtomicBool = AtomicBool::new(false);

impl Sched {
    fn new() -> Self {
        Sched {
            threads: BTreeMap::new(),
            run_queues: core::array::from_fn(|_| VecDeque::new()),
            timeout_list: VecDeque::new(),
            cores: [const { None }; MAX_CORES],
            next_tid: 1,
            yield_calls: 0,
        }
    }

    fn alloc_tid(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        tid
    }

    fn ccb(&self, cid: usize) -> &CoreCcb {
        self.cores[cid].as_ref().expect("scheduler not running on this core")
    }

    /// Transition a Stopped or Init thread to Ready.
    ///
    /// Removes it from the timeout list if it was sleeping with a deadline,
    /// and enqueues it unless its context is still Dirty (in which case the
    /// core it is switching away from will keep running it). Idempotent for
    /// threads that are already Ready or Running, and for released tids.
    fn make_ready(&mut self, tid: Tid) -> bool {
        let (had_timeout, phase, priority) = {
            let Some(tcb) = self.threads.get_mut(&tid) else {
                return false;
            };
            if tcb.state != ThreadState::Stopped && tcb.state != ThreadState::Init {
                return false;
            }
            let had_timeout = tcb.wakeup_time.take().is_some();
            tcb.state = ThreadState::Ready;
            (had_timeout, tcb.phase, tcb.priority)
        };
        if had_timeout {
            self.timeout_list.retain(|&t| t != tid);
        }
        if phase == CtxPhase::Clean {
            self.run_queues[priority].push_back(tid);
        }
        true
    }

    /// Put the current thread on the timeout list, sorted by deadline.
    fn register_timeout(&mut self, tid: Tid, deadline: u64) {
        if let Some(tcb) = self.threads.get_mut(&tid) {
            tcb.wakeup_time = Some(deadline);
        }
        let pos = self
            .timeout_list
            .iter()
            .position(|t| {
                self.threads
                    .get(t)
                    .and_then(|tcb| tcb.wakeup_time)
                    .is_none_or(|w| w > deadline)
            })
            .unwrap_or(self.timeout_list.len());
        self.timeout_list.insert(pos, tid);
    }

    /// Wake every thread whose deadline has passed.
    fn wake_expired(&mut self, now: u64) {
        while let Some(&tid) = self.timeout_list.front() {
            let due = self
                .threads
                .get(&tid)
                .and_then(|tcb| tcb.wakeup_time)
                .is_none_or(|w| w <= now);
            if !due {
                break;
            }
            if !self.make_ready(tid) {
                // Stale entry for a thread that no longer exists.
                self.timeout_list.pop_front();
            }
        }
    }

    /// Anti-starvation boost: raise every queued thread one level and
    /// requeue it there. Walked top-down so no thread moves twice.
    fn boost(&mut self) {
        for level in (0..PRIORITY_QUEUES - 1).rev() {
            let moved = core::mem::take(&mut self.run_queues[level]);
            for tid in moved {
                if let Some(tcb) = self.threads.get_mut(&tid) {
                    tcb.priority = level + 1;
                }
                self.run_queues[level + 1].push_back(tid);
            }
        }
    }

    /// Pop the best ready thread, scanning from the highest level down.
    /// Falls back to the current thread if it is still Ready, else to this
    /// core's idle thread. The chosen thread gets a fresh full timeslice.
    fn select_next(&mut self, cid: usize, current: Tid) -> Tid {
        let mut choice = None;
        for level in (0..PRIORITY_QUEUES).rev() {
            if let Some(tid) = self.run_queues[level].pop_front() {
                choice = Some(tid);
                break;
            }
        }
        let tid = choice.unwrap_or_else(|| {
            let still_ready =
                self.threads.get(&current).map(|t| t.state) == Some(ThreadState::Ready);
            if still_ready { current } else { self.ccb(cid).idle }
        });
        if let Some(tcb) = self.threads.get_mut(&tid) {
            tcb.its = QUANTUM_MS;
        }
        tid
    }
}

/// Initialize the scheduler tables. Called once during boot, before any
/// thread is spawned.
pub fn init() {
    *SCHED.lock() = Some(Sched::new());
    log::info!("Scheduler initialized ({} priority levels)", PRIORITY_QUEUES);
}

/// Create a new thread owned by process `owner`. The thread starts in Init
/// state and does not run until someone calls `wakeup` on it.
pub fn spawn_thread(owner: Pid, entry: fn()) -> Tid {
    let was_on = machine::preempt_off();
    let tid = {
        let mut guard = SCHED.lock();
        let s = guard.as_mut().expect("scheduler not initialized");
        let tid = s.alloc_tid();
        let tcb = Box::new(Tcb::new_normal(
            tid,
            owner,
            entry,
            PRIORITY_QUEUES - 1,
            QUANTUM_MS,
            thread_start,
        ));
        s.threads.insert(tid, tcb);
        tid
    };
    if was_on {
        machine::preempt_on();
    }
    active_threads_adjust(1);
    tid
}

/// Make a Stopped or Init thread Ready. Returns whether a transition
/// happened; waking an already-ready thread is a no-op.
pub fn wakeup(tid: Tid) -> bool {
    let was_on = machine::preempt_off();
    let woke = {
        let mut guard = SCHED.lock();
        guard.as_mut().expect("scheduler not initialized").make_ready(tid)
    };
    if was_on {
        machine::preempt_on();
    }
    if woke {
        machine::core_restart_one();
    }
    woke
}

/// Atomically release `guard` and put the current thread to sleep.
///
/// `state` must be Stopped (parked, will be woken) or Exited (never runs
/// again; its TCB is reclaimed after the switch). A Stopped sleep may carry
/// a timeout in milliseconds; the thread is then woken by the timeout list
/// if nothing signals it first. The guard is dropped after the state change
/// is visible under the scheduler lock, so no wakeup can slip between the
/// release and the sleep.
pub fn sleep_releasing<G>(
    state: ThreadState,
    guard: G,
    cause: SchedCause,
    timeout_ms: Option<u64>,
) {
    assert!(
        state == ThreadState::Stopped || state == ThreadState::Exited,
        "sleep_releasing: invalid target state {:?}",
        state
    );

    let was_on = machine::preempt_off();
    {
        let mut sched_guard = SCHED.lock();
        let s = sched_guard.as_mut().expect("scheduler not initialized");
        let tid = s.ccb(machine::core_id()).current;
        if let Some(tcb) = s.threads.get_mut(&tid) {
            tcb.state = state;
        }
        if state == ThreadState::Stopped {
            if let Some(ms) = timeout_ms {
                let deadline = machine::timer::clock_ms() + ms.max(1);
                s.register_timeout(tid, deadline);
            }
        }
        drop(guard);
    }
    yield_cpu(cause);
    if was_on {
        machine::preempt_on();
    }
}

/// Give up the CPU, recording why.
///
/// Cancels the alarm (capturing the unexpired timeslice), wakes any expired
/// sleepers, runs the periodic boost, picks the next thread and switches to
/// it. When the calling thread is eventually switched back in, its priority
/// is adjusted according to `cause` and a new timeslice begins via gain().
pub fn yield_cpu(cause: SchedCause) {
    let remaining = machine::timer::cancel_alarm();
    let was_on = machine::preempt_off();
    let cid = machine::core_id();

    let mut switch_pair: Option<(*mut CpuContext, *const CpuContext)> = None;
    {
        let mut guard = SCHED.lock();
        let s = guard.as_mut().expect("scheduler not initialized");

        s.yield_calls += 1;
        let boost_due = s.yield_calls >= YIELDS;
        if boost_due {
            s.yield_calls = 0;
        }

        let cur_tid = s.ccb(cid).current;
        {
            let cur = s.threads.get_mut(&cur_tid).expect("current thread missing");
            if cur.state == ThreadState::Running {
                cur.state = ThreadState::Ready;
            }
            cur.rts = remaining;
            cur.last_cause = cur.curr_cause;
            cur.curr_cause = cause;
        }

        s.wake_expired(machine::timer::clock_ms());
        if boost_due {
            s.boost();
        }

        let next_tid = s.select_next(cid, cur_tid);
        let ccb = s.cores[cid].as_mut().expect("scheduler not running on this core");
        ccb.previous = cur_tid;
        if next_tid != cur_tid {
            ccb.current = next_tid;
            let from = {
                let t = s.threads.get_mut(&cur_tid).expect("current thread missing");
                &mut t.context as *mut CpuContext
            };
            let to = {
                let t = s.threads.get(&next_tid).expect("next thread missing");
                &t.context as *const CpuContext
            };
            switch_pair = Some((from, to));
        }
    }

    // The lock must be free across the switch: the incoming thread takes it
    // again in gain(). The TCB boxes behind the raw pointers cannot move or
    // be reclaimed before the switch completes.
    if let Some((from, to)) = switch_pair {
        unsafe {
            machine::context::switch(from, to);
        }
    }

    // Back on a core, possibly much later. Adjust priority by the cause we
    // went to sleep with, then start the new timeslice.
    {
        let mut guard = SCHED.lock();
        let s = guard.as_mut().expect("scheduler not initialized");
        let cur_tid = s.ccb(machine::core_id()).current;
        let cur = s.threads.get_mut(&cur_tid).expect("current thread missing");
        match cause {
            SchedCause::Quantum => cur.priority = cur.priority.saturating_sub(1),
            SchedCause::Io => cur.priority = (cur.priority + 1).min(PRIORITY_QUEUES - 1),
            SchedCause::Mutex => {
                if cur.last_cause == SchedCause::Mutex {
                    cur.priority = cur.priority.saturating_sub(1);
                }
            }
            _ => cur.priority = 0,
        }
    }

    gain(was_on);
}

/// Begin a timeslice on the current core.
///
/// Runs at the top of every switch-in: from yield_cpu's return path, and
/// from thread_start for a first-ever run. Marks the current thread
/// Running/Dirty, grants it its timeslice, disposes of the thread the core
/// just switched away from, and re-arms the alarm. `preempt` says whether
/// to re-enter the preemptive domain; paths that must stay non-preemptive
/// (a sleep that will be retried under a held lock) pass false.
pub fn gain(preempt: bool) {
    let cid = machine::core_id();
    let mut released_prev = false;
    let rts;
    {
        let mut guard = SCHED.lock();
        let s = guard.as_mut().expect("scheduler not initialized");
        let ccb = s.ccb(cid);
        let cur_tid = ccb.current;
        let prev_tid = ccb.previous;

        {
            let cur = s.threads.get_mut(&cur_tid).expect("current thread missing");
            cur.state = ThreadState::Running;
            cur.phase = CtxPhase::Dirty;
            cur.rts = cur.its;
            rts = cur.rts;
        }

        if prev_tid != cur_tid {
            let (prev_state, prev_kind, prev_priority) = {
                let prev = s.threads.get_mut(&prev_tid).expect("previous thread missing");
                prev.phase = CtxPhase::Clean;
                (prev.state, prev.kind, prev.priority)
            };
            match prev_state {
                ThreadState::Ready => {
                    if prev_kind != ThreadKind::Idle {
                        s.run_queues[prev_priority].push_back(prev_tid);
                        machine::core_restart_one();
                    }
                }
                ThreadState::Exited => {
                    // Safe to reclaim now: the dead thread is off its stack.
                    s.threads.remove(&prev_tid);
                    released_prev = true;
                }
                ThreadState::Stopped => {
                    // Parked; it sits on a condvar or the timeout list.
                }
                ThreadState::Init | ThreadState::Running => {
                    unreachable!("previous thread in state {:?}", prev_state)
                }
            }
        }
    }
    if released_prev {
        active_threads_adjust(-1);
    }
    if preempt {
        machine::preempt_on();
    }
    machine::timer::set_alarm(rts);
}

/// Entry point of every normal thread. Finishes the switch that started it,
/// then runs the thread function, which must end the thread itself (for a
/// process main thread, by exiting the process).
extern "C" fn thread_start() -> ! {
    gain(true);
    let entry = {
        let was_on = machine::preempt_off();
        let f = {
            let guard = SCHED.lock();
            let s = guard.as_ref().expect("scheduler not initialized");
            let tid = s.ccb(machine::core_id()).current;
            s.threads
                .get(&tid)
                .and_then(|t| t.entry)
                .expect("normal thread without an entry function")
        };
        if was_on {
            machine::preempt_on();
        }
        f
    };
    entry();
    unreachable!("thread function returned instead of exiting");
}

/// ALARM interrupt entry: the running thread's timeslice expired.
pub fn alarm_handler() {
    if SCHED_STARTED.load(Ordering::SeqCst) {
        yield_cpu(SchedCause::Quantum);
    }
}

/// Sleep the current thread for `ms` milliseconds via the timeout list.
pub fn sleep_ms(ms: u64) {
    sleep_releasing(ThreadState::Stopped, (), SchedCause::User, Some(ms));
}

/// Terminate the calling thread. Its TCB and stack are reclaimed by the
/// next thread's gain phase. Process main threads exit through the process
/// layer instead; this is for bare kernel threads.
pub fn exit_thread() -> ! {
    sleep_releasing(ThreadState::Exited, (), SchedCause::User, None);
    unreachable!("exited thread resumed");
}

/// Turn the calling core over to the scheduler. The boot context becomes
/// this core's idle thread; the call returns only when the last normal
/// thread has exited and the scheduler shuts down.
pub fn run_scheduler() {
    let cid = machine::core_id();
    {
        let mut guard = SCHED.lock();
        let s = guard.as_mut().expect("scheduler not initialized");
        let idle_tid = s.alloc_tid();
        s.threads.insert(idle_tid, Box::new(Tcb::new_idle(idle_tid, QUANTUM_MS)));
        s.cores[cid] = Some(CoreCcb { current: idle_tid, previous: idle_tid, idle: idle_tid });
    }
    SCHED_STARTED.store(true, Ordering::SeqCst);
    log::info!("Scheduler running on core {}", cid);

    machine::preempt_on();
    idle_loop();

    SCHED_STARTED.store(false, Ordering::SeqCst);
    log::info!("Scheduler finished on core {}", cid);
}

/// The idle thread body. Halts between wakeups while work remains; once the
/// last normal thread is gone, cancels the alarm, restarts the other cores
/// and returns, ending the scheduler on this core.
fn idle_loop() {
    yield_cpu(SchedCause::Idle);
    while active_threads() > 0 {
        machine::core_halt();
        yield_cpu(SchedCause::Idle);
    }
    machine::timer::cancel_alarm();
    machine::core_restart_all();
}

/// Number of live normal threads.
pub fn active_threads() -> usize {
    x86_64::instructions::interrupts::without_interrupts(|| *ACTIVE_THREADS.lock())
}

/// The thread currently executing on this core.
pub fn current() -> Tid {
    let was_on = machine::preempt_off();
    let tid = {
        let guard = SCHED.lock();
        guard
            .as_ref()
            .expect("scheduler not initialized")
            .ccb(machine::core_id())
            .current
    };
    if was_on {
        machine::preempt_on();
    }
    tid
}

/// The process the current thread executes for.
pub fn current_owner() -> Pid {
    let was_on = machine::preempt_off();
    let pid = {
        let guard = SCHED.lock();
        let s = guard.as_ref().expect("scheduler not initialized");
        let tid = s.ccb(machine::core_id()).current;
        s.threads.get(&tid).map(|t| t.owner).unwrap_or(Pid(0))
    };
    if was_on {
        machine::preempt_on();
    }
    pid
}

/// A thread's current priority level, if it still exists. Diagnostics only.
pub fn thread_priority(tid: Tid) -> Option<usize> {
    let was_on = machine::preempt_off();
    let prio = {
        let guard = SCHED.lock();
        guard
            .as_ref()
            .expect("scheduler not initialized")
            .threads
            .get(&tid)
            .map(|t| t.priority)
    };
    if was_on {
        machine::preempt_on();
    }
    prio
}

/// A thread's current state, if it still exists. Diagnostics only.
pub fn thread_state(tid: Tid) -> Option<ThreadState> {
    let was_on = machine::preempt_off();
    let state = {
        let guard = SCHED.lock();
        guard
            .as_ref()
            .expect("scheduler not initialized")
            .threads
            .get(&tid)
            .map(|t| t.state)
    };
    if was_on {
        machine::preempt_on();
    }
    state
}
