/*
 * Thread Control Block
 *
 * Per-thread state for the multilevel-feedback scheduler: CPU context and
 * stack, the state machine, timeslice bookkeeping, the yield-cause history
 * that drives priority feedback, and the optional wakeup deadline.
 *
 * A Tcb appears in at most one of: the ready queue of its priority level,
 * the timeout list, or some condition variable's wait list. The scheduler
 * lock guards every field except the stack contents.
 */

use alloc::boxed::Box;
use alloc::vec;
use core::fmt;

use crate::machine::context::CpuContext;
use crate::proc::Pid;

/// Thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tid(pub usize);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Thread stack size (64 KiB per thread).
pub const THREAD_STACK_SIZE: usize = 64 * 1024;

/// Thread state machine.
///
/// Init threads have been spawned but never woken. Stopped threads are
/// parked on a condition variable or the timeout list. Exited threads are
/// waiting for the next context switch to reclaim them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Init,
    Ready,
    Running,
    Stopped,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Normal,
    Idle,
}

/// Whether the saved CpuContext is current.
///
/// A thread is Dirty from the moment it starts running on a core until the
/// switch away from it completes. A Dirty thread must not be enqueued on a
/// ready queue: another core could pick it up and resume a stale context
/// while the first core is still executing on its stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxPhase {
    Clean,
    Dirty,
}

/// Why a thread gave up the CPU. Feeds the priority feedback policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedCause {
    /// Timeslice expired (alarm preemption).
    Quantum,
    /// Blocked waiting for I/O readiness.
    Io,
    /// Blocked on a contended lock.
    Mutex,
    /// Blocked inside a pipe transfer.
    Pipe,
    /// Process-level waiting (Exit, WaitChild) and timed sleeps.
    User,
    /// Cooperative yield with nothing to wait for.
    Idle,
}

pub struct Tcb {
    pub id: Tid,
    /// The process this thread executes for. Idle threads belong to PID 0.
    pub owner: Pid,
    pub kind: ThreadKind,
    pub state: ThreadState,
    pub phase: CtxPhase,
    /// Priority level, 0..PRIORITY_QUEUES; higher is served first.
    pub priority: usize,
    /// Initial timeslice in ms, granted when the thread is selected.
    pub its: u64,
    /// Remaining timeslice in ms, captured when the alarm is cancelled.
    pub rts: u64,
    pub last_cause: SchedCause,
    pub curr_cause: SchedCause,
    /// Absolute wakeup deadline in ms while on the timeout list.
    pub wakeup_time: Option<u64>,
    /// Function the thread runs, entered through `thread_start`. The idle
    /// threads have none; they never pass through `thread_start`.
    pub entry: Option<fn()>,
    pub context: CpuContext,
    stack: Box<[u8]>,
}

impl Tcb {
    /// Build a normal thread: fresh stack, context staged to enter
    /// `thread_start`, top priority, full timeslice.
    pub fn new_normal(
        id: Tid,
        owner: Pid,
        entry: fn(),
        top_priority: usize,
        quantum: u64,
        thread_start: extern "C" fn() -> !,
    ) -> Self {
        let stack = vec![0u8; THREAD_STACK_SIZE].into_boxed_slice();
        let stack_top = stack.as_ptr() as usize + THREAD_STACK_SIZE;
        Tcb {
            id,
            owner,
            kind: ThreadKind::Normal,
            state: ThreadState::Init,
            phase: CtxPhase::Clean,
            priority: top_priority,
            its: quantum,
            rts: quantum,
            last_cause: SchedCause::Idle,
            curr_cause: SchedCause::Idle,
            wakeup_time: None,
            entry: Some(entry),
            context: CpuContext::prepare(stack_top, thread_start),
            stack,
        }
    }

    /// Build a core's idle thread. It adopts the stack it is first entered
    /// on (the core's boot stack), so it owns no stack memory and its
    /// context is filled in by the first switch away from it.
    pub fn new_idle(id: Tid, quantum: u64) -> Self {
        Tcb {
            id,
            owner: Pid(0),
            kind: ThreadKind::Idle,
            state: ThreadState::Running,
            phase: CtxPhase::Dirty,
            priority: 0,
            its: quantum,
            rts: quantum,
            last_cause: SchedCause::Idle,
            curr_cause: SchedCause::Idle,
            wakeup_time: None,
            entry: None,
            context: CpuContext::empty(),
            stack: Box::new([]),
        }
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("stack_size", &self.stack.len())
            .finish()
    }
}
