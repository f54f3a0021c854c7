/*
 * Kernel I/O
 *
 * The file-id surface of the kernel: byte transfers and close on whatever
 * stream object a fid resolves to, plus the stream classes themselves
 * (pipes, sockets, the procinfo stream) and the FCB bridge they plug into.
 */

pub mod fcb;
pub mod pipe;
pub mod procinfo;
pub mod socket;

pub use fcb::{Errno, Fid, MAX_FILEID, NOFILE};

/// Read from a fid of the calling process. Returns the bytes copied, 0 at
/// end-of-stream, or -1 on a bad fid / failed transfer.
pub fn sys_read(fid: Fid, buf: &mut [u8]) -> isize {
    let Some(fcb) = crate::proc::get_fcb(fid) else {
        return -1;
    };
    match fcb.read(buf) {
        Ok(n) => n as isize,
        Err(_) => -1,
    }
}

/// Write to a fid of the calling process. Returns the bytes accepted or -1.
pub fn sys_write(fid: Fid, buf: &[u8]) -> isize {
    let Some(fcb) = crate::proc::get_fcb(fid) else {
        return -1;
    };
    match fcb.write(buf) {
        Ok(n) => n as isize,
        Err(_) => -1,
    }
}

/// Close a fid of the calling process. Returns 0 or -1.
pub fn sys_close(fid: Fid) -> i32 {
    match crate::proc::close_fid(fid) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}
