/*
 * Process Info Stream
 *
 * A read-only stream over the process table. Every read yields exactly one
 * fixed-size record describing the next occupied slot and advances the
 * stream's cursor; past the last slot, reads report end-of-stream.
 */

use alloc::sync::Arc;
use spin::Mutex;

use crate::proc::{self, MAX_PROC};

use super::fcb::{Errno, Fid, NOFILE, Stream};

/// Bytes of the argument buffer carried in each record.
pub const PROCINFO_ARGS_MAX: usize = 32;

/// Serialized record size.
pub const PROCINFO_RECORD_SIZE: usize = 17 + PROCINFO_ARGS_MAX;

/// One decoded record, as delivered to readers of the info stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: u32,
    pub ppid: u32,
    pub alive: bool,
    pub thread_count: u32,
    /// Full length of the process's argument buffer.
    pub argl: u32,
    /// Leading bytes of the argument buffer, zero-padded.
    pub args: [u8; PROCINFO_ARGS_MAX],
}

impl ProcInfo {
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.pid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.ppid.to_le_bytes());
        buf[8] = self.alive as u8;
        buf[9..13].copy_from_slice(&self.thread_count.to_le_bytes());
        buf[13..17].copy_from_slice(&self.argl.to_le_bytes());
        buf[17..17 + PROCINFO_ARGS_MAX].copy_from_slice(&self.args);
    }

    pub fn decode(buf: &[u8]) -> ProcInfo {
        let mut args = [0u8; PROCINFO_ARGS_MAX];
        args.copy_from_slice(&buf[17..17 + PROCINFO_ARGS_MAX]);
        ProcInfo {
            pid: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            ppid: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            alive: buf[8] != 0,
            thread_count: u32::from_le_bytes(buf[9..13].try_into().unwrap()),
            argl: u32::from_le_bytes(buf[13..17].try_into().unwrap()),
            args,
        }
    }
}

/// Stream state: the next process-table index to report.
struct ProcInfoStream {
    cursor: Mutex<usize>,
}

impl Stream for ProcInfoStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        if buf.len() < PROCINFO_RECORD_SIZE {
            return Err(Errno::EINVAL);
        }
        let mut cursor = self.cursor.lock();
        while *cursor < MAX_PROC {
            let index = *cursor;
            *cursor += 1;
            let Some(record) = proc::info_record(index) else {
                continue;
            };

            let mut args = [0u8; PROCINFO_ARGS_MAX];
            let argl = record.args.as_ref().map_or(0, |a| a.len());
            if let Some(bytes) = record.args.as_deref() {
                let n = bytes.len().min(PROCINFO_ARGS_MAX);
                args[..n].copy_from_slice(&bytes[..n]);
            }

            ProcInfo {
                pid: record.pid.0 as u32,
                ppid: record.ppid.0 as u32,
                alive: record.alive,
                thread_count: record.thread_count as u32,
                argl: argl as u32,
                args,
            }
            .encode(buf);
            return Ok(PROCINFO_RECORD_SIZE);
        }
        Ok(0)
    }
}

/// Open a process info stream in the calling process. Returns NOFILE when
/// the file table is full.
pub fn sys_open_info() -> Fid {
    let stream: Arc<dyn Stream> = Arc::new(ProcInfoStream { cursor: Mutex::new(0) });
    match proc::reserve_fids(&[stream]) {
        Ok(fids) => fids[0],
        Err(_) => NOFILE,
    }
}
