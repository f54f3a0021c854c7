/*
 * Process Tests
 *
 * Lifecycle coverage through the syscall surface: exec with argument
 * marshaling, exit values through wait_child, wait validation and
 * idempotence, orphan reparenting to init, and the procinfo stream.
 *
 * These run as the init process, which doubles as the adopter in the
 * reparenting scenario.
 */

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::io::procinfo::{PROCINFO_RECORD_SIZE, ProcInfo};
use crate::io::{self, procinfo};
use crate::proc::{self, NOPROC, Pid};
use crate::sched;

use super::Tally;

static ECHO_ARGS_OK: AtomicUsize = AtomicUsize::new(0);
static ECHO_PPID_OK: AtomicUsize = AtomicUsize::new(0);

/// Child task: checks its argument buffer and parentage, exits 42.
fn echo_task(args: Option<&[u8]>) -> i32 {
    if args == Some(b"hello\0".as_slice()) {
        ECHO_ARGS_OK.store(1, Ordering::SeqCst);
    }
    if proc::get_ppid() == Pid(1) {
        ECHO_PPID_OK.store(1, Ordering::SeqCst);
    }
    42
}

/// Grandchild that exits as soon as it runs.
fn quick_orphan_task(args: Option<&[u8]>) -> i32 {
    args.map_or(0, |a| a[0] as i32)
}

/// Grandchild that outlives its parent, forcing the live-reparent path.
fn slow_orphan_task(_args: Option<&[u8]>) -> i32 {
    sched::sleep_ms(40);
    30
}

/// Middle process: spawns three children and exits without waiting for
/// them, leaving init to adopt the lot.
fn middle_task(_args: Option<&[u8]>) -> i32 {
    proc::exec(Some(quick_orphan_task), Some(&[10]));
    proc::exec(Some(quick_orphan_task), Some(&[20]));
    proc::exec(Some(slow_orphan_task), None);
    // Give the quick ones a chance to become zombies so both the zombie
    // splice and the live reparent are exercised.
    sched::sleep_ms(15);
    7
}

pub fn run() -> (usize, usize) {
    let mut t = Tally::new();

    t.check("init runs as pid 1", proc::get_pid() == Pid(1));
    t.check("init has parent 0", proc::get_ppid() == Pid(0));

    // Exec a child with an argument buffer, collect its exit value.
    ECHO_ARGS_OK.store(0, Ordering::SeqCst);
    ECHO_PPID_OK.store(0, Ordering::SeqCst);
    let count_before = proc::process_count();
    let cpid = proc::exec(Some(echo_task), Some(b"hello\0"));
    t.check("exec returns a fresh pid", cpid != NOPROC && cpid.0 > 1);

    let mut status = 0;
    let reaped = proc::wait_child(cpid, Some(&mut status));
    t.check("specific wait reaps the child", reaped == cpid);
    t.check("exit value arrives through wait", status == 42);
    t.check("child saw its argument copy", ECHO_ARGS_OK.load(Ordering::SeqCst) == 1);
    t.check("child saw init as parent", ECHO_PPID_OK.load(Ordering::SeqCst) == 1);
    t.check(
        "process count returns to baseline",
        proc::process_count() == count_before,
    );

    // A reaped pid is gone: waiting again must fail.
    t.check(
        "second wait on the same pid fails",
        proc::wait_child(cpid, None) == NOPROC,
    );

    // Waiting on something that is not our live child must fail.
    t.check(
        "wait on a free slot fails",
        proc::wait_child(Pid(200), None) == NOPROC,
    );
    t.check(
        "wait with no children fails",
        proc::wait_child(NOPROC, None) == NOPROC,
    );

    // Reparenting: the middle process exits before its three children are
    // reaped; init inherits them all and drains exactly four processes.
    let middle = proc::exec(Some(middle_task), None);
    t.check("middle process launched", middle != NOPROC);

    let mut reaped_count = 0;
    let mut middle_status = -1;
    let mut orphan_sum = 0;
    loop {
        let mut s = 0;
        let pid = proc::wait_child(NOPROC, Some(&mut s));
        if pid == NOPROC {
            break;
        }
        reaped_count += 1;
        if pid == middle {
            middle_status = s;
        } else {
            orphan_sum += s;
        }
    }
    t.check("init reaped middle and all three orphans", reaped_count == 4);
    t.check("middle exit value preserved", middle_status == 7);
    t.check("orphan exit values preserved", orphan_sum == 10 + 20 + 30);
    t.check("no process left behind", proc::process_count() == count_before);

    // Procinfo stream: one record per read, cursor over occupied slots.
    let info_fid = procinfo::sys_open_info();
    t.check("procinfo stream opens", info_fid != io::NOFILE);
    let mut buf = [0u8; PROCINFO_RECORD_SIZE];
    let mut records = 0;
    let mut saw_init = false;
    let mut saw_scheduler = false;
    loop {
        let n = io::sys_read(info_fid, &mut buf);
        if n == 0 {
            break;
        }
        if n != PROCINFO_RECORD_SIZE as isize {
            break;
        }
        records += 1;
        let rec = ProcInfo::decode(&buf);
        if rec.pid == 1 {
            saw_init = rec.alive && rec.ppid == 0 && rec.thread_count == 1;
        }
        if rec.pid == 0 {
            saw_scheduler = rec.alive;
        }
    }
    t.check("procinfo yields one record per occupied slot", records == 2);
    t.check("procinfo reports the scheduler process", saw_scheduler);
    t.check("procinfo reports init correctly", saw_init);
    t.check(
        "procinfo rejects writes",
        io::sys_write(info_fid, b"x") == -1,
    );
    t.check("procinfo closes", io::sys_close(info_fid) == 0);

    (t.passed, t.failed)
}
