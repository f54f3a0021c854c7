/*
 * Process Management
 *
 * The process table and the process-level system calls:
 * - exec
 * - exit
 * - wait_child
 * - get_pid / get_ppid
 *
 * A process owns its file table, its argument buffer, its child bookkeeping
 * and the threads that execute it. Threads are scheduler objects; the PCB
 * tracks them through PTCB records and a main-thread handle.
 *
 * The whole table sits behind one lock. Blocking calls (wait_child, exit's
 * final sleep) hand their table guard to sleep_releasing, which orders the
 * sleep before the release so no child-exit broadcast can be lost.
 *
 * Lifecycle: slots cycle FREE -> ALIVE -> ZOMBIE -> FREE. A zombie holds
 * nothing but its exit value; everything else is torn down in exit(). The
 * slot itself is recycled by the parent's wait_child (or by init, which
 * adopts and drains orphans).
 */

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use spin::Mutex;

use crate::io::fcb::{Errno, Fcb, Fid, MAX_FILEID, Stream};
use crate::sched::{self, CondVar, SchedCause, ThreadState, Tid, condvar};

/// Process identifier: an index into the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub usize);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

/// Returned by pid-producing calls on failure. Pid 0 is the scheduler
/// process, which no call can legitimately return.
pub const NOPROC: Pid = Pid(0);

/// Size of the process table.
pub const MAX_PROC: usize = 256;

/// A process main function: receives the argument bytes exec copied for it,
/// returns the exit value.
pub type Task = fn(Option<&[u8]>) -> i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Free,
    Alive,
    Zombie,
}

/// Per-thread process-level record: one for every thread spawned within the
/// process, linking the scheduler's TCB to the task it runs.
pub struct Ptcb {
    pub tcb: Tid,
    pub task: Task,
    pub args: Option<Arc<[u8]>>,
    pub exited: bool,
    pub detached: bool,
    pub exit_cv: CondVar,
    pub refcount: usize,
}

/// Process control block.
pub struct Pcb {
    pub state: ProcState,
    pub parent: Option<Pid>,
    pub exitval: i32,
    pub main_task: Option<Task>,
    /// Process-owned copy of the exec arguments.
    pub args: Option<Arc<[u8]>>,
    /// File table; slots share FCBs with other processes after inheritance.
    pub fidt: [Option<Arc<Fcb>>; MAX_FILEID],
    pub children: Vec<Pid>,
    /// Children that have exited and await reaping.
    pub exited: Vec<Pid>,
    /// Signalled every time one of this process's children exits.
    pub child_exit: CondVar,
    pub thread_count: usize,
    pub ptcbs: Vec<Ptcb>,
    pub main_thread: Option<Tid>,
}

impl Pcb {
    fn new() -> Self {
        Pcb {
            state: ProcState::Free,
            parent: None,
            exitval: 0,
            main_task: None,
            args: None,
            fidt: [const { None }; MAX_FILEID],
            children: Vec::new(),
            exited: Vec::new(),
            child_exit: CondVar::new(),
            thread_count: 0,
            ptcbs: Vec::new(),
            main_thread: None,
        }
    }
}

struct ProcTable {
    slots: Vec<Pcb>,
    /// Free pids, popped from the back; lowest pids go out first at boot.
    free_list: Vec<Pid>,
    count: usize,
}

impl ProcTable {
    fn slot(&self, pid: Pid) -> &Pcb {
        &self.slots[pid.0]
    }

    fn slot_mut(&mut self, pid: Pid) -> &mut Pcb {
        &mut self.slots[pid.0]
    }

    fn acquire(&mut self) -> Option<Pid> {
        let pid = self.free_list.pop()?;
        self.slots[pid.0].state = ProcState::Alive;
        self.count += 1;
        Some(pid)
    }

    fn release(&mut self, pid: Pid) {
        self.slots[pid.0] = Pcb::new();
        self.free_list.push(pid);
        self.count -= 1;
    }
}

static PROC_TABLE: Mutex<Option<ProcTable>> = Mutex::new(None);

fn with_table<R>(f: impl FnOnce(&mut ProcTable) -> R) -> R {
    let mut guard = PROC_TABLE.lock();
    f(guard.as_mut().expect("process table not initialized"))
}

/// Build the process table and install the scheduler process at pid 0.
pub fn init() {
    {
        let mut guard = PROC_TABLE.lock();
        let mut slots = Vec::with_capacity(MAX_PROC);
        for _ in 0..MAX_PROC {
            slots.push(Pcb::new());
        }
        let mut free_list = Vec::with_capacity(MAX_PROC);
        for i in (0..MAX_PROC).rev() {
            free_list.push(Pid(i));
        }
        *guard = Some(ProcTable { slots, free_list, count: 0 });
    }

    // The null "scheduler" process: owns the idle threads, runs no task.
    let pid = exec(None, None);
    assert!(pid == Pid(0), "the scheduler process must get pid 0");
    log::info!("Process table initialized ({} slots)", MAX_PROC);
}

/// Entry of every process main thread: fetch the task and arguments from
/// the freshly built PCB and run them, exiting with the returned value.
fn start_main_thread() {
    let pid = sched::current_owner();
    let (task, args) = with_table(|t| {
        let slot = t.slot(pid);
        (
            slot.main_task.expect("main thread started without a task"),
            slot.args.clone(),
        )
    });
    let exitval = task(args.as_deref());
    exit(exitval);
}

/// Create a new process running `task`.
///
/// Processes with pid 0 or 1 (the scheduler process and init) are
/// parentless; every other process becomes a child of the caller and
/// inherits its file table, bumping each shared FCB. The argument bytes are
/// copied into storage owned by the new process. Returns NOPROC when the
/// table is full.
pub fn exec(task: Option<Task>, args: Option<&[u8]>) -> Pid {
    let mut guard = PROC_TABLE.lock();
    let table = guard.as_mut().expect("process table not initialized");

    let Some(pid) = table.acquire() else {
        return NOPROC;
    };

    if pid.0 > 1 {
        let parent = sched::current_owner();
        table.slot_mut(parent).children.push(pid);
        let inherited = table.slot(parent).fidt.clone();
        let slot = table.slot_mut(pid);
        slot.parent = Some(parent);
        slot.fidt = inherited;
    }

    {
        let slot = table.slot_mut(pid);
        slot.main_task = task;
        slot.args = args.map(Arc::from);
    }

    // Spawning and waking the main thread is the last step: once it is
    // woken it may run immediately, so the PCB must already be complete.
    let mut spawned = None;
    if let Some(call) = task {
        let tid = sched::spawn_thread(pid, start_main_thread);
        let slot = table.slot_mut(pid);
        slot.main_thread = Some(tid);
        slot.ptcbs.push(Ptcb {
            tcb: tid,
            task: call,
            args: slot.args.clone(),
            exited: false,
            detached: false,
            exit_cv: CondVar::new(),
            refcount: 1,
        });
        slot.thread_count += 1;
        spawned = Some(tid);
    }
    drop(guard);

    if let Some(tid) = spawned {
        sched::wakeup(tid);
    }
    pid
}

/// Pid of the calling process.
pub fn get_pid() -> Pid {
    sched::current_owner()
}

/// Pid of the caller's parent; 0 for init and the scheduler process.
pub fn get_ppid() -> Pid {
    let me = get_pid();
    with_table(|t| t.slot(me).parent.unwrap_or(Pid(0)))
}

/// Number of non-FREE process slots.
pub fn process_count() -> usize {
    with_table(|t| t.count)
}

/// Reap a zombie: deliver its exit value, unlink it from its parent's
/// bookkeeping and recycle the slot.
fn cleanup_zombie(table: &mut ProcTable, cpid: Pid, status: &mut Option<&mut i32>) {
    let (exitval, parent) = {
        let child = table.slot(cpid);
        (child.exitval, child.parent)
    };
    if let Some(s) = status.as_deref_mut() {
        *s = exitval;
    }
    if let Some(ppid) = parent {
        let p = table.slot_mut(ppid);
        p.children.retain(|&c| c != cpid);
        p.exited.retain(|&c| c != cpid);
    }
    table.release(cpid);
}

fn wait_for_specific_child(cpid: Pid, mut status: Option<&mut i32>) -> Pid {
    if cpid.0 >= MAX_PROC {
        return NOPROC;
    }
    let me = get_pid();
    let mytid = sched::current();
    loop {
        let mut guard = PROC_TABLE.lock();
        let table = guard.as_mut().expect("process table not initialized");
        {
            let child = table.slot(cpid);
            if child.state == ProcState::Free || child.parent != Some(me) {
                return NOPROC;
            }
            if child.state == ProcState::Zombie {
                cleanup_zombie(table, cpid, &mut status);
                return cpid;
            }
        }
        // Alive: sleep until some child of ours exits, then re-check.
        table.slot_mut(me).child_exit.add_waiter(mytid);
        sched::sleep_releasing(ThreadState::Stopped, guard, SchedCause::User, None);
    }
}

fn wait_for_any_child(mut status: Option<&mut i32>) -> Pid {
    let me = get_pid();
    let mytid = sched::current();
    loop {
        let mut guard = PROC_TABLE.lock();
        let table = guard.as_mut().expect("process table not initialized");
        if table.slot(me).children.is_empty() {
            return NOPROC;
        }
        if let Some(&cpid) = table.slot(me).exited.first() {
            cleanup_zombie(table, cpid, &mut status);
            return cpid;
        }
        table.slot_mut(me).child_exit.add_waiter(mytid);
        sched::sleep_releasing(ThreadState::Stopped, guard, SchedCause::User, None);
    }
}

/// Wait for a child to exit and reap it.
///
/// With `cpid == NOPROC`, waits for any child; otherwise `cpid` must be a
/// live child of the caller. Returns the reaped pid, storing its exit value
/// through `status`, or NOPROC on validation failure / no children.
pub fn wait_child(cpid: Pid, status: Option<&mut i32>) -> Pid {
    if cpid != NOPROC {
        wait_for_specific_child(cpid, status)
    } else {
        wait_for_any_child(status)
    }
}

/// Terminate the calling process. Never returns.
///
/// Init first drains every remaining child. Any other process hands its
/// live children to init, splices its unreaped zombies into init's exited
/// list, and queues itself on its parent's exited list. The argument buffer
/// and the file table go away here; the slot then waits as a zombie for the
/// parent to reap it, and the calling thread sleeps as EXITED so the
/// scheduler reclaims it on the next switch.
pub fn exit(exitval: i32) -> ! {
    let me = get_pid();
    with_table(|t| t.slot_mut(me).exitval = exitval);

    if me == Pid(1) {
        while wait_child(NOPROC, None) != NOPROC {}
    }

    let mut fcbs: Vec<Arc<Fcb>> = Vec::new();
    {
        let mut guard = PROC_TABLE.lock();
        let table = guard.as_mut().expect("process table not initialized");

        if me != Pid(1) {
            let init = Pid(1);
            let parent = table.slot(me).parent.expect("non-init process without a parent");

            // Reparent live children to init.
            let kids = mem::take(&mut table.slot_mut(me).children);
            for &k in &kids {
                table.slot_mut(k).parent = Some(init);
            }
            table.slot_mut(init).children.extend(kids);

            // Hand over unreaped zombies and let init know.
            let zombies = mem::take(&mut table.slot_mut(me).exited);
            if !zombies.is_empty() {
                table.slot_mut(init).exited.extend(zombies);
                condvar::broadcast(&mut table.slot_mut(init).child_exit);
            }

            table.slot_mut(parent).exited.push(me);

            let slot = table.slot_mut(me);
            assert!(slot.children.is_empty() && slot.exited.is_empty());
            slot.args = None;
            for entry in slot.fidt.iter_mut() {
                if let Some(fcb) = entry.take() {
                    fcbs.push(fcb);
                }
            }
            slot.main_thread = None;
            slot.state = ProcState::Zombie;

            condvar::broadcast(&mut table.slot_mut(parent).child_exit);
        } else {
            let slot = table.slot_mut(me);
            assert!(slot.children.is_empty() && slot.exited.is_empty());
            slot.args = None;
            for entry in slot.fidt.iter_mut() {
                if let Some(fcb) = entry.take() {
                    fcbs.push(fcb);
                }
            }
            slot.main_thread = None;
            slot.state = ProcState::Zombie;
        }
    }

    // Release the inherited streams outside the table lock; the final
    // reference to a pipe or socket runs its close operation here.
    drop(fcbs);

    sched::sleep_releasing(ThreadState::Exited, (), SchedCause::User, None);
    unreachable!("exited process resumed");
}

/*
 * File-table plumbing used by the stream classes.
 */

/// Atomically claim one fid per stream from the caller's file table.
/// Either every stream gets a slot, or the table is left untouched and
/// EMFILE comes back.
pub fn reserve_fids(streams: &[Arc<dyn Stream>]) -> Result<Vec<Fid>, Errno> {
    let me = get_pid();
    with_table(|t| {
        let slot = t.slot_mut(me);
        let free: Vec<usize> = (0..MAX_FILEID)
            .filter(|&i| slot.fidt[i].is_none())
            .take(streams.len())
            .collect();
        if free.len() < streams.len() {
            return Err(Errno::EMFILE);
        }
        let mut fids = Vec::with_capacity(streams.len());
        for (&i, stream) in free.iter().zip(streams) {
            slot.fidt[i] = Some(Arc::new(Fcb::new(stream.clone())));
            fids.push(i as Fid);
        }
        Ok(fids)
    })
}

/// Resolve a fid of the calling process to its FCB.
pub fn get_fcb(fid: Fid) -> Option<Arc<Fcb>> {
    if fid < 0 || fid as usize >= MAX_FILEID {
        return None;
    }
    let me = get_pid();
    with_table(|t| t.slot(me).fidt[fid as usize].clone())
}

/// Drop the calling process's reference to a fid. The stream's close
/// operation runs when this was the last reference anywhere.
pub fn close_fid(fid: Fid) -> Result<(), Errno> {
    if fid < 0 || fid as usize >= MAX_FILEID {
        return Err(Errno::EBADF);
    }
    let me = get_pid();
    let taken = with_table(|t| t.slot_mut(me).fidt[fid as usize].take());
    match taken {
        // Dropped outside the table lock; may run the close operation.
        Some(fcb) => {
            drop(fcb);
            Ok(())
        }
        None => Err(Errno::EBADF),
    }
}

/*
 * Introspection snapshot for the procinfo stream.
 */

pub struct ProcRecord {
    pub pid: Pid,
    pub ppid: Pid,
    pub alive: bool,
    pub thread_count: usize,
    pub args: Option<Arc<[u8]>>,
}

/// Snapshot of the process slot at `index`, or None while it is FREE.
pub fn info_record(index: usize) -> Option<ProcRecord> {
    if index >= MAX_PROC {
        return None;
    }
    with_table(|t| {
        let slot = t.slot(Pid(index));
        if slot.state == ProcState::Free {
            return None;
        }
        Some(ProcRecord {
            pid: Pid(index),
            ppid: slot.parent.unwrap_or(Pid(0)),
            alive: slot.state == ProcState::Alive,
            thread_count: slot.thread_count,
            args: slot.args.clone(),
        })
    })
}
