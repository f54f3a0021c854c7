/*
 * Stream Sockets
 *
 * In-kernel peer sockets built on pipes. A socket is born UNBOUND with a
 * remembered port, becomes a LISTENER through listen (claiming its slot in
 * the port map), and turns into a PEER through the connect/accept
 * rendezvous, which couples two sockets with a pair of pipes: one ring per
 * direction, wired crosswise.
 *
 * The rendezvous works through connection requests queued on the listener:
 * connect pushes a request and waits (bounded) on the request's own
 * condition variable; accept pops a request, builds the server-side peer
 * and both pipes, marks the request admitted and signals it. A request that
 * times out removes itself from the listener queue on the way out, so
 * abandoned requests never reach accept.
 *
 * Lock order, outermost first: PORT_MAP, socket inner, request/pipe inner,
 * scheduler. Paths that need a later lock release the earlier one first
 * when the order would invert (listener close clears the port map after
 * dropping the socket lock).
 */

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use crate::proc;
use crate::sched::{self, CondVar, SchedCause, ThreadState, condvar};

use super::fcb::{Errno, Fid, NOFILE, Stream};
use super::pipe::{PipeCb, new_pipe, pipe_read, pipe_reader_close, pipe_write, pipe_writer_close};

/// Port number. 0 is NOPORT; bindable ports are 1..=MAX_PORT.
pub type Port = u16;

pub const NOPORT: Port = 0;
pub const MAX_PORT: Port = 1023;

bitflags! {
    /// Which direction(s) a shutdown tears down.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShutdownMode: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
        const BOTH = Self::READ.bits() | Self::WRITE.bits();
    }
}

pub struct SocketCb {
    inner: Mutex<SocketInner>,
}

struct SocketInner {
    /// The port requested at creation; claimed only by listen.
    port: Port,
    state: SocketState,
}

enum SocketState {
    Unbound,
    Listener(ListenerState),
    Peer(PeerState),
}

struct ListenerState {
    /// Pending connection requests, oldest first.
    queue: VecDeque<Arc<ConnRequest>>,
    /// Accepters park here while the queue is empty.
    req_available: CondVar,
}

struct PeerState {
    read_pipe: Option<PipeCb>,
    write_pipe: Option<PipeCb>,
    /// The socket on the other side of the rendezvous.
    peer: Weak<SocketCb>,
}

/// One connect/accept rendezvous. Lives on the listener queue from connect
/// until accept pops it or the connector gives up.
pub struct ConnRequest {
    client: Arc<SocketCb>,
    inner: Mutex<ConnReqInner>,
}

struct ConnReqInner {
    admitted: bool,
    connect_cv: CondVar,
}

impl ConnRequest {
    /// Park the connector on this request until an accept admits it or the
    /// timeout runs out. Refusal and timeout both come back as ETIMEDOUT;
    /// either way the caller no longer owes the listener anything but the
    /// dequeue of its abandoned request.
    fn await_admission(&self, timeout_ms: u64) -> Result<(), Errno> {
        let tid = sched::current();
        {
            let mut ri = self.inner.lock();
            ri.connect_cv.add_waiter(tid);
            sched::sleep_releasing(ThreadState::Stopped, ri, SchedCause::Pipe, Some(timeout_ms));
        }
        let mut ri = self.inner.lock();
        // Deregister in case the timeout, not accept, woke us.
        ri.connect_cv.remove_waiter(tid);
        if ri.admitted { Ok(()) } else { Err(Errno::ETIMEDOUT) }
    }
}

/// One listener per port, while it lives.
static PORT_MAP: Mutex<Option<Vec<Option<Arc<SocketCb>>>>> = Mutex::new(None);

pub fn init() {
    *PORT_MAP.lock() = Some(vec![None; MAX_PORT as usize + 1]);
    log::info!("Socket layer initialized ({} ports)", MAX_PORT);
}

fn port_map_get(port: Port) -> Option<Arc<SocketCb>> {
    let guard = PORT_MAP.lock();
    guard.as_ref().expect("socket layer not initialized")[port as usize].clone()
}

/// The byte-stream view of a socket, installed behind its FCB.
struct SocketStream {
    scb: Arc<SocketCb>,
}

impl SocketStream {
    fn half_pipe(&self, read_side: bool) -> Option<PipeCb> {
        let inner = self.scb.inner.lock();
        match &inner.state {
            SocketState::Peer(p) => {
                if read_side { p.read_pipe.clone() } else { p.write_pipe.clone() }
            }
            _ => None,
        }
    }
}

impl Stream for SocketStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        match self.half_pipe(true) {
            Some(pipe) => pipe_read(&pipe, buf),
            None => Err(Errno::ENOTCONN),
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        match self.half_pipe(false) {
            Some(pipe) => pipe_write(&pipe, buf),
            None => Err(Errno::ENOTCONN),
        }
    }

    fn close(&self) -> Result<(), Errno> {
        socket_close(&self.scb);
        Ok(())
    }

    fn as_socket(&self) -> Option<Arc<SocketCb>> {
        Some(self.scb.clone())
    }
}

/// Tear down a socket when its last file reference goes away.
///
/// A peer closes both of its pipe ends. A listener wakes every blocked
/// accepter and vacates its port slot; the accepters then observe the empty
/// slot and fail.
fn socket_close(scb: &Arc<SocketCb>) {
    enum Teardown {
        Nothing,
        Peer(Option<PipeCb>, Option<PipeCb>),
        Listener(Port),
    }

    let action = {
        let mut inner = scb.inner.lock();
        let port = inner.port;
        match &mut inner.state {
            SocketState::Peer(p) => Teardown::Peer(p.read_pipe.take(), p.write_pipe.take()),
            SocketState::Listener(l) => {
                condvar::broadcast(&mut l.req_available);
                Teardown::Listener(port)
            }
            SocketState::Unbound => Teardown::Nothing,
        }
    };

    match action {
        Teardown::Nothing => {}
        Teardown::Peer(rp, wp) => {
            if let Some(rp) = rp {
                pipe_reader_close(&rp);
            }
            if let Some(wp) = wp {
                pipe_writer_close(&wp);
            }
        }
        Teardown::Listener(port) => {
            let mut guard = PORT_MAP.lock();
            let map = guard.as_mut().expect("socket layer not initialized");
            let slot = &mut map[port as usize];
            if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, scb)) {
                *slot = None;
            }
        }
    }
}

/// Create an unbound socket remembering `port`. Returns NOFILE when the
/// port is out of range or the file table is full.
pub fn sys_socket(port: Port) -> Fid {
    if port > MAX_PORT {
        return NOFILE;
    }
    let scb = Arc::new(SocketCb {
        inner: Mutex::new(SocketInner { port, state: SocketState::Unbound }),
    });
    let stream: Arc<dyn Stream> = Arc::new(SocketStream { scb });
    match proc::reserve_fids(&[stream]) {
        Ok(fids) => fids[0],
        Err(_) => NOFILE,
    }
}

/// Turn an unbound socket into the listener for its port.
pub fn sys_listen(fid: Fid) -> i32 {
    let Some(fcb) = proc::get_fcb(fid) else {
        return -1;
    };
    let Some(scb) = fcb.as_socket() else {
        return -1;
    };

    let mut guard = PORT_MAP.lock();
    let map = guard.as_mut().expect("socket layer not initialized");
    let mut inner = scb.inner.lock();
    if !matches!(inner.state, SocketState::Unbound) {
        return -1;
    }
    if inner.port == NOPORT {
        return -1;
    }
    let slot = &mut map[inner.port as usize];
    if slot.is_some() {
        return -1;
    }
    *slot = Some(scb.clone());
    inner.state = SocketState::Listener(ListenerState {
        queue: VecDeque::new(),
        req_available: CondVar::new(),
    });
    0
}

/// Connect an unbound socket to the listener on `port`.
///
/// Queues a rendezvous request and waits up to `timeout_ms` for an accept
/// to admit it. Returns 0 on admission; -1 on validation failure, on a port
/// with no listener, or on timeout, after which the request has been pulled
/// back off the listener queue before returning.
pub fn sys_connect(fid: Fid, port: Port, timeout_ms: u64) -> i32 {
    if port == NOPORT || port > MAX_PORT {
        return -1;
    }
    let Some(lscb) = port_map_get(port) else {
        return -1;
    };
    let Some(fcb) = proc::get_fcb(fid) else {
        return -1;
    };
    let Some(scb) = fcb.as_socket() else {
        return -1;
    };
    if !matches!(scb.inner.lock().state, SocketState::Unbound) {
        return -1;
    }

    let req = Arc::new(ConnRequest {
        client: scb,
        inner: Mutex::new(ConnReqInner { admitted: false, connect_cv: CondVar::new() }),
    });

    {
        let mut li = lscb.inner.lock();
        let SocketState::Listener(l) = &mut li.state else {
            return -1;
        };
        l.queue.push_back(req.clone());
        condvar::broadcast(&mut l.req_available);
    }

    match req.await_admission(timeout_ms) {
        Ok(()) => 0,
        Err(_) => {
            // Gave up: the request must not linger for a later accept to find.
            let mut li = lscb.inner.lock();
            if let SocketState::Listener(l) = &mut li.state {
                l.queue.retain(|r| !Arc::ptr_eq(r, &req));
            }
            -1
        }
    }
}

/// Accept one connection on a listening socket.
///
/// Blocks until a request arrives; each wakeup re-checks that the listener
/// still holds its port, failing with NOFILE once it has been closed. On
/// success both sockets become peers over a fresh pair of pipes and the
/// connector is released; returns the server-side fid.
pub fn sys_accept(lfid: Fid) -> Fid {
    let Some(fcb) = proc::get_fcb(lfid) else {
        return NOFILE;
    };
    let Some(lscb) = fcb.as_socket() else {
        return NOFILE;
    };

    let tid = sched::current();
    let req = loop {
        let mut li = lscb.inner.lock();
        let port = li.port;
        let SocketState::Listener(l) = &mut li.state else {
            return NOFILE;
        };
        if let Some(req) = l.queue.pop_front() {
            break req;
        }
        l.req_available.add_waiter(tid);
        sched::sleep_releasing(ThreadState::Stopped, li, SchedCause::Io, None);

        let still_installed =
            port_map_get(port).is_some_and(|s| Arc::ptr_eq(&s, &lscb));
        if !still_installed {
            return NOFILE;
        }
    };

    // The server-side peer socket and its fid.
    let server = Arc::new(SocketCb {
        inner: Mutex::new(SocketInner { port: NOPORT, state: SocketState::Unbound }),
    });
    let stream: Arc<dyn Stream> = Arc::new(SocketStream { scb: server.clone() });
    let Ok(fids) = proc::reserve_fids(&[stream]) else {
        // No fid for the peer: refuse the request so the connector fails
        // promptly instead of waiting out its timeout.
        let mut ri = req.inner.lock();
        condvar::broadcast(&mut ri.connect_cv);
        return NOFILE;
    };

    // One ring per direction: the client reads pipe1 and writes pipe2.
    let pipe1 = new_pipe();
    let pipe2 = new_pipe();
    {
        let mut ci = req.client.inner.lock();
        ci.state = SocketState::Peer(PeerState {
            read_pipe: Some(pipe1.clone()),
            write_pipe: Some(pipe2.clone()),
            peer: Arc::downgrade(&server),
        });
    }
    {
        let mut si = server.inner.lock();
        si.state = SocketState::Peer(PeerState {
            read_pipe: Some(pipe2),
            write_pipe: Some(pipe1),
            peer: Arc::downgrade(&req.client),
        });
    }

    {
        let mut ri = req.inner.lock();
        ri.admitted = true;
        condvar::signal(&mut ri.connect_cv);
    }

    fids[0]
}

/// Close one or both directions of a peer socket. The matching pipe end is
/// closed and forgotten; later transfers in that direction fail.
pub fn sys_shutdown(fid: Fid, how: ShutdownMode) -> i32 {
    let Some(fcb) = proc::get_fcb(fid) else {
        return -1;
    };
    let Some(scb) = fcb.as_socket() else {
        return -1;
    };

    let (rp, wp) = {
        let mut inner = scb.inner.lock();
        let SocketState::Peer(p) = &mut inner.state else {
            return -1;
        };
        let rp = if how.contains(ShutdownMode::READ) { p.read_pipe.take() } else { None };
        let wp = if how.contains(ShutdownMode::WRITE) { p.write_pipe.take() } else { None };
        (rp, wp)
    };
    if let Some(rp) = rp {
        pipe_reader_close(&rp);
    }
    if let Some(wp) = wp {
        pipe_writer_close(&wp);
    }
    0
}
