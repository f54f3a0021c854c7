/*
 * Pipe Tests
 *
 * Byte-stream laws on the in-kernel pipe: chunked round trips, end-of-
 * stream after writer close, broken-pipe failures after reader close, the
 * one-slot-shy capacity with writer blocking across processes, and the
 * all-or-nothing fid reservation.
 */

use alloc::vec::Vec;

use crate::io::{self, Fid, pipe, socket};
use crate::proc::{self, NOPROC};
use crate::sched;

use super::Tally;

fn pattern(i: usize) -> u8 {
    ((i * 7 + 3) % 251) as u8
}

/// Child side of the capacity test: pushes a full PIPE_BUFFER_SIZE bytes
/// through the inherited write end. The ring holds one byte less, so this
/// cannot finish until the parent starts draining.
fn writer_task(args: Option<&[u8]>) -> i32 {
    let Some(args) = args else {
        return 1;
    };
    let w = args[1] as Fid;
    let data: Vec<u8> = (0..pipe::PIPE_BUFFER_SIZE).map(pattern).collect();
    let mut sent = 0;
    while sent < data.len() {
        let n = io::sys_write(w, &data[sent..]);
        if n <= 0 {
            return 1;
        }
        sent += n as usize;
    }
    0
}

pub fn run() -> (usize, usize) {
    let mut t = Tally::new();

    // Chunked round trip inside one process.
    let Some((r, w)) = pipe::sys_pipe() else {
        t.check("pipe creation", false);
        return (t.passed, t.failed);
    };
    t.check("pipe yields two distinct fids", r != w);

    let message: Vec<u8> = (0..100).map(pattern).collect();
    let mut sent = 0;
    for chunk in message.chunks(33) {
        let n = io::sys_write(w, chunk);
        t.check("chunk write accepted whole", n == chunk.len() as isize);
        sent += n.max(0) as usize;
    }
    let mut echoed = Vec::new();
    while echoed.len() < sent {
        let mut buf = [0u8; 17];
        let n = io::sys_read(r, &mut buf);
        if n <= 0 {
            break;
        }
        echoed.extend_from_slice(&buf[..n as usize]);
    }
    t.check("bytes come back in order", echoed == message);

    // Wrong-direction operations bounce off the op-table.
    t.check("read on the write end fails", io::sys_read(w, &mut [0u8; 4]) == -1);
    t.check("write on the read end fails", io::sys_write(r, b"nope") == -1);

    // Writer close drains to end-of-stream.
    let n = io::sys_write(w, b"xyz");
    t.check("final write accepted", n == 3);
    t.check("writer closes", io::sys_close(w) == 0);
    let mut buf = [0u8; 8];
    t.check("residue still readable", io::sys_read(r, &mut buf) == 3 && &buf[..3] == b"xyz");
    t.check("then end-of-stream", io::sys_read(r, &mut buf) == 0);
    t.check("reader closes", io::sys_close(r) == 0);
    t.check("double close fails", io::sys_close(r) == -1);

    // Reader close breaks the writer.
    let (r2, w2) = pipe::sys_pipe().expect("second pipe");
    io::sys_close(r2);
    t.check("write after reader close fails", io::sys_write(w2, b"lost") == -1);
    io::sys_close(w2);

    // Capacity: a full buffer write blocks the child until we drain. The
    // child can only finish once every byte has moved, so a clean join
    // plus an intact pattern proves both the blocking and the FIFO order.
    let (r3, w3) = pipe::sys_pipe().expect("capacity pipe");
    let child = proc::exec(Some(writer_task), Some(&[r3 as u8, w3 as u8]));
    t.check("writer child launched", child != NOPROC);
    io::sys_close(w3);
    sched::sleep_ms(20);

    let mut received = Vec::with_capacity(pipe::PIPE_BUFFER_SIZE);
    let mut chunk = [0u8; 1024];
    while received.len() < pipe::PIPE_BUFFER_SIZE {
        let n = io::sys_read(r3, &mut chunk);
        if n <= 0 {
            break;
        }
        received.extend_from_slice(&chunk[..n as usize]);
    }
    t.check("full buffer crossed the pipe", received.len() == pipe::PIPE_BUFFER_SIZE);
    t.check(
        "pattern survived the ring wraps",
        received.iter().enumerate().all(|(i, &b)| b == pattern(i)),
    );
    t.check("end-of-stream after the child is gone", io::sys_read(r3, &mut chunk) == 0);
    let mut status = -1;
    t.check("writer child reaped", proc::wait_child(child, Some(&mut status)) == child);
    t.check("writer child finished clean", status == 0);
    io::sys_close(r3);

    // Reservation is all-or-nothing: with one slot left a pipe must fail
    // without consuming it, and a one-fid stream must still fit.
    let mut held: Vec<Fid> = Vec::new();
    for _ in 0..7 {
        let (a, b) = pipe::sys_pipe().expect("filler pipe");
        held.push(a);
        held.push(b);
    }
    let lone = socket::sys_socket(0);
    t.check("fifteenth fid granted", lone != io::NOFILE);
    t.check("pipe refused with one slot left", pipe::sys_pipe().is_none());
    let last = socket::sys_socket(0);
    t.check("refused pipe consumed nothing", last != io::NOFILE);
    io::sys_close(lone);
    io::sys_close(last);
    for fid in held {
        io::sys_close(fid);
    }
    t.check("table drains back to empty", pipe::sys_pipe().is_some_and(|(a, b)| {
        io::sys_close(a) == 0 && io::sys_close(b) == 0
    }));

    (t.passed, t.failed)
}
