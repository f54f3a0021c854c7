/*
 * Pipes
 *
 * A bounded single-direction byte channel between file ids. One ring buffer
 * is shared by a reader stream and a writer stream; two condition variables
 * coordinate the two ends: has_data parks readers on an empty ring,
 * has_space parks writers on a full one.
 *
 * Half-close drives the termination protocol. Closing the writer wakes
 * blocked readers so they drain the ring down to end-of-stream; closing the
 * reader wakes blocked writers so they fail with a broken pipe. The ring
 * itself lives exactly as long as some end still references it.
 */

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::proc;
use crate::sched::{self, CondVar, SchedCause, ThreadState, condvar};

use super::fcb::{Errno, Fid, Stream};

pub const PIPE_BUFFER_SIZE: usize = 16384;

/// Shared state of one pipe.
///
/// The ring distinguishes empty (r == w) from full ((w + 1) % N == r), so
/// at most PIPE_BUFFER_SIZE - 1 bytes are in flight at once.
pub struct PipeInner {
    buffer: Vec<u8>,
    r_position: usize,
    w_position: usize,
    reader_open: bool,
    writer_open: bool,
    /// Readers park here while the ring is empty.
    has_data: CondVar,
    /// Writers park here while the ring is full.
    has_space: CondVar,
}

pub type PipeCb = Arc<Mutex<PipeInner>>;

impl PipeInner {
    pub fn new() -> Self {
        PipeInner {
            buffer: vec![0; PIPE_BUFFER_SIZE],
            r_position: 0,
            w_position: 0,
            reader_open: true,
            writer_open: true,
            has_data: CondVar::new(),
            has_space: CondVar::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.r_position == self.w_position
    }

    fn is_full(&self) -> bool {
        (self.w_position + 1) % PIPE_BUFFER_SIZE == self.r_position
    }

    /// Copy out up to `buf.len()` bytes. Returns the number copied.
    fn read_some(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() && !self.is_empty() {
            buf[n] = self.buffer[self.r_position];
            self.r_position = (self.r_position + 1) % PIPE_BUFFER_SIZE;
            n += 1;
        }
        n
    }

    /// Copy in up to `buf.len()` bytes. Returns the number accepted.
    fn write_some(&mut self, buf: &[u8]) -> usize {
        let mut n = 0;
        while n < buf.len() && !self.is_full() {
            self.buffer[self.w_position] = buf[n];
            self.w_position = (self.w_position + 1) % PIPE_BUFFER_SIZE;
            n += 1;
        }
        n
    }
}

/// Fresh pipe state with both ends open.
pub fn new_pipe() -> PipeCb {
    Arc::new(Mutex::new(PipeInner::new()))
}

/// Read from a pipe, blocking while it is empty and a writer remains.
///
/// Returns 0 once the writer end is closed and the ring is drained. Fails
/// with EPIPE when the reader end itself has been closed.
pub fn pipe_read(pipe: &Mutex<PipeInner>, buf: &mut [u8]) -> Result<usize, Errno> {
    let tid = sched::current();
    loop {
        let mut p = pipe.lock();
        if !p.reader_open {
            return Err(Errno::EPIPE);
        }
        if p.is_empty() {
            if !p.writer_open {
                return Ok(0); // end of stream
            }
            p.has_data.add_waiter(tid);
            sched::sleep_releasing(ThreadState::Stopped, p, SchedCause::Pipe, None);
            continue;
        }
        let n = p.read_some(buf);
        condvar::broadcast(&mut p.has_space);
        return Ok(n);
    }
}

/// Write to a pipe, blocking while it is full and the reader remains.
///
/// Accepts as many bytes as fit (at least one) and reports the count; a
/// short write is the caller's cue to come back for the rest. Fails with
/// EPIPE once the reader end is closed, including while blocked.
pub fn pipe_write(pipe: &Mutex<PipeInner>, buf: &[u8]) -> Result<usize, Errno> {
    let tid = sched::current();
    loop {
        let mut p = pipe.lock();
        if !p.reader_open || !p.writer_open {
            return Err(Errno::EPIPE);
        }
        if p.is_full() {
            p.has_space.add_waiter(tid);
            sched::sleep_releasing(ThreadState::Stopped, p, SchedCause::Pipe, None);
            continue;
        }
        let n = p.write_some(buf);
        condvar::broadcast(&mut p.has_data);
        return Ok(n);
    }
}

/// Close the reader end: blocked writers wake and fail with EPIPE.
pub fn pipe_reader_close(pipe: &Mutex<PipeInner>) {
    let mut p = pipe.lock();
    p.reader_open = false;
    condvar::broadcast(&mut p.has_space);
}

/// Close the writer end: blocked readers wake and drain to end-of-stream.
pub fn pipe_writer_close(pipe: &Mutex<PipeInner>) {
    let mut p = pipe.lock();
    p.writer_open = false;
    condvar::broadcast(&mut p.has_data);
}

/// The read end as a stream object.
struct PipeReader {
    pipe: PipeCb,
}

impl Stream for PipeReader {
    fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        pipe_read(&self.pipe, buf)
    }

    fn close(&self) -> Result<(), Errno> {
        pipe_reader_close(&self.pipe);
        Ok(())
    }
}

/// The write end as a stream object.
struct PipeWriter {
    pipe: PipeCb,
}

impl Stream for PipeWriter {
    fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        pipe_write(&self.pipe, buf)
    }

    fn close(&self) -> Result<(), Errno> {
        pipe_writer_close(&self.pipe);
        Ok(())
    }
}

/// Create a pipe in the calling process.
///
/// Reserves two fids over one shared ring (the read end first, then the
/// write end), or returns None with nothing reserved when the file table
/// cannot take two more entries.
pub fn sys_pipe() -> Option<(Fid, Fid)> {
    let pipe = new_pipe();
    let reader: Arc<dyn Stream> = Arc::new(PipeReader { pipe: pipe.clone() });
    let writer: Arc<dyn Stream> = Arc::new(PipeWriter { pipe });
    let fids = proc::reserve_fids(&[reader, writer]).ok()?;
    Some((fids[0], fids[1]))
}
