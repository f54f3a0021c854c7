/*
 * File Control Blocks
 *
 * Every file id a process holds resolves to an FCB, and every FCB binds one
 * stream object to the {read, write, close} operations of its class. Pipes,
 * sockets and the procinfo stream all plug in through the Stream trait;
 * operations a class does not support fall through to the default EBADF
 * implementations, the way a null slot in an op-table would reject them.
 *
 * Sharing works through reference counting: duplicating a file table entry
 * clones the Arc, and the stream's close operation runs when the last
 * reference goes away (process exit, or an explicit close of the final fid).
 */

use alloc::sync::Arc;

use super::socket::SocketCb;

/// File id: an index into a process's file table.
pub type Fid = i32;

/// Returned by file-id-producing calls on failure.
pub const NOFILE: Fid = -1;

/// Size of each process's file table.
pub const MAX_FILEID: usize = 16;

/// Kernel error codes, POSIX-flavored. Only errors the kernel actually
/// raises; allocation failure is fatal and never surfaces as an errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    EBADF = 9,      // Bad file descriptor / unsupported operation
    EINVAL = 22,    // Invalid argument
    EMFILE = 24,    // File table full
    EPIPE = 32,     // Other end of the pipe is gone
    ENOTCONN = 107, // Socket has no transport in that direction
    ETIMEDOUT = 110, // Timed wait expired
}

/// The op-table every stream class implements.
///
/// `read` returns the bytes copied, 0 at end-of-stream, or an error;
/// `write` returns the bytes accepted or an error; `close` runs once, when
/// the last reference to the stream's FCB is released. Classes leave the
/// operations they do not support to the defaults.
pub trait Stream: Send + Sync {
    fn read(&self, _buf: &mut [u8]) -> Result<usize, Errno> {
        Err(Errno::EBADF)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize, Errno> {
        Err(Errno::EBADF)
    }

    fn close(&self) -> Result<(), Errno> {
        Ok(())
    }

    /// Recover the socket control block behind this stream, if it is one.
    /// The socket syscalls need the control block itself, not just the
    /// byte-stream view of it.
    fn as_socket(&self) -> Option<Arc<SocketCb>> {
        None
    }
}

/// A file control block: one stream object plus close-on-last-release.
pub struct Fcb {
    stream: Arc<dyn Stream>,
}

impl Fcb {
    pub fn new(stream: Arc<dyn Stream>) -> Self {
        Fcb { stream }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        self.stream.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        self.stream.write(buf)
    }

    pub fn as_socket(&self) -> Option<Arc<SocketCb>> {
        self.stream.as_socket()
    }
}

impl Drop for Fcb {
    fn drop(&mut self) {
        // Last reference gone; run the class close operation.
        let _ = self.stream.close();
    }
}
