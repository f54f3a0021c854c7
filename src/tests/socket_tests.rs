/*
 * Socket Tests
 *
 * The listener/connect/accept rendezvous end to end: a server and client
 * process exchanging bytes over a peer pair, the validation surface of
 * every socket call, connect timeouts (including that an abandoned request
 * never reaches a later accept), listener teardown under a blocked accept,
 * and directional shutdown.
 *
 * Helper kernel threads stand in for second threads of the init process
 * where a test needs someone on the other side of a blocking call.
 */

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicIsize, Ordering};

use crate::io::{self, Fid, NOFILE, pipe, socket};
use crate::io::socket::ShutdownMode;
use crate::machine;
use crate::proc::{self, NOPROC};
use crate::sched;

use super::Tally;

static SERVER_READY: AtomicBool = AtomicBool::new(false);

/// Server process for the ping/pong scenario: one accept, one exchange.
fn server_task(_args: Option<&[u8]>) -> i32 {
    let lfid = socket::sys_socket(80);
    if lfid == NOFILE {
        return 1;
    }
    if socket::sys_listen(lfid) != 0 {
        return 2;
    }
    SERVER_READY.store(true, Ordering::SeqCst);

    let peer = socket::sys_accept(lfid);
    if peer == NOFILE {
        return 3;
    }
    let mut buf = [0u8; 4];
    let mut got = 0;
    while got < 4 {
        let n = io::sys_read(peer, &mut buf[got..]);
        if n <= 0 {
            return 4;
        }
        got += n as usize;
    }
    if &buf != b"ping" {
        return 5;
    }
    if io::sys_write(peer, b"pong") != 4 {
        return 6;
    }
    socket::sys_shutdown(peer, ShutdownMode::BOTH);
    io::sys_close(peer);
    io::sys_close(lfid);
    0
}

/// Client process: connect to the server and run the reverse exchange.
fn client_task(_args: Option<&[u8]>) -> i32 {
    let fid = socket::sys_socket(0);
    if fid == NOFILE {
        return 1;
    }
    let mut tries = 0;
    while !SERVER_READY.load(Ordering::SeqCst) {
        sched::sleep_ms(5);
        tries += 1;
        if tries > 200 {
            return 2;
        }
    }
    if socket::sys_connect(fid, 80, 1000) != 0 {
        return 3;
    }
    if io::sys_write(fid, b"ping") != 4 {
        return 4;
    }
    let mut buf = [0u8; 4];
    let mut got = 0;
    while got < 4 {
        let n = io::sys_read(fid, &mut buf[got..]);
        if n <= 0 {
            return 5;
        }
        got += n as usize;
    }
    if &buf != b"pong" {
        return 6;
    }
    socket::sys_shutdown(fid, ShutdownMode::BOTH);
    io::sys_close(fid);
    0
}

static RETRY_LFID: AtomicI32 = AtomicI32::new(NOFILE);
static RETRY_ACCEPTED: AtomicIsize = AtomicIsize::new(-2);

/// Accepts once on the timeout-test listener and parks the resulting fid.
fn retry_accepter_thread() {
    let fid = socket::sys_accept(RETRY_LFID.load(Ordering::SeqCst));
    RETRY_ACCEPTED.store(fid as isize, Ordering::SeqCst);
    sched::exit_thread();
}

static CLOSER_LFID: AtomicI32 = AtomicI32::new(NOFILE);

/// Pulls the listener out from under a blocked accept.
fn listener_closer_thread() {
    sched::sleep_ms(30);
    io::sys_close(CLOSER_LFID.load(Ordering::SeqCst));
    sched::exit_thread();
}

static PAIR_LFID: AtomicI32 = AtomicI32::new(NOFILE);
static PAIR_ACCEPTED: AtomicIsize = AtomicIsize::new(-2);

/// Accepts the peer used by the shutdown-direction checks.
fn pair_accepter_thread() {
    let fid = socket::sys_accept(PAIR_LFID.load(Ordering::SeqCst));
    PAIR_ACCEPTED.store(fid as isize, Ordering::SeqCst);
    sched::exit_thread();
}

pub fn run() -> (usize, usize) {
    let mut t = Tally::new();
    let me = proc::get_pid();

    // Full scenario across two processes.
    SERVER_READY.store(false, Ordering::SeqCst);
    let server = proc::exec(Some(server_task), None);
    let client = proc::exec(Some(client_task), None);
    t.check("server and client launched", server != NOPROC && client != NOPROC);
    let mut server_status = -1;
    let mut client_status = -1;
    t.check(
        "server reaped",
        proc::wait_child(server, Some(&mut server_status)) == server,
    );
    t.check(
        "client reaped",
        proc::wait_child(client, Some(&mut client_status)) == client,
    );
    t.check("server ran the exchange clean", server_status == 0);
    t.check("client ran the exchange clean", client_status == 0);

    // Nobody listens on port 99.
    let fid = socket::sys_socket(0);
    t.check("connect to a silent port fails fast", socket::sys_connect(fid, 99, 100) == -1);
    io::sys_close(fid);

    // Validation surface.
    let (pr, pw) = pipe::sys_pipe().expect("probe pipe");
    t.check("listen on a non-socket fails", socket::sys_listen(pr) == -1);
    io::sys_close(pr);
    io::sys_close(pw);

    let unbound = socket::sys_socket(socket::NOPORT);
    t.check("listen without a port fails", socket::sys_listen(unbound) == -1);
    t.check("accept on an unbound socket fails", socket::sys_accept(unbound) == NOFILE);
    t.check(
        "shutdown on an unbound socket fails",
        socket::sys_shutdown(unbound, ShutdownMode::BOTH) == -1,
    );
    io::sys_close(unbound);

    t.check("socket on a wild port fails", socket::sys_socket(socket::MAX_PORT + 1) == NOFILE);

    let first = socket::sys_socket(300);
    let second = socket::sys_socket(300);
    t.check("first listener claims the port", socket::sys_listen(first) == 0);
    t.check("second listener is refused", socket::sys_listen(second) == -1);
    t.check("connect on a listener fid fails", socket::sys_connect(first, 300, 50) == -1);
    io::sys_close(first);
    t.check("closed port can be claimed again", socket::sys_listen(second) == 0);
    io::sys_close(second);

    // Connect timeout, and the abandoned request must not linger: a later
    // accept has to pair with the fresh connect, which only works if the
    // timed-out request left the queue.
    let lfid = socket::sys_socket(500);
    socket::sys_listen(lfid);
    RETRY_LFID.store(lfid, Ordering::SeqCst);
    RETRY_ACCEPTED.store(-2, Ordering::SeqCst);

    let stale = socket::sys_socket(0);
    let before = machine::timer::clock_ms();
    t.check("unaccepted connect times out", socket::sys_connect(stale, 500, 40) == -1);
    t.check(
        "timeout waited its full window",
        machine::timer::clock_ms() - before >= 40,
    );
    io::sys_close(stale);

    let accepter = sched::spawn_thread(me, retry_accepter_thread);
    sched::wakeup(accepter);
    sched::sleep_ms(10);

    let fresh = socket::sys_socket(0);
    t.check("fresh connect succeeds after the timeout", socket::sys_connect(fresh, 500, 1000) == 0);
    let mut waited = 0;
    while RETRY_ACCEPTED.load(Ordering::SeqCst) == -2 && waited < 200 {
        sched::sleep_ms(5);
        waited += 1;
    }
    let accepted = RETRY_ACCEPTED.load(Ordering::SeqCst);
    t.check("accept paired with the fresh request", accepted >= 0);
    if accepted >= 0 {
        io::sys_close(accepted as Fid);
    }
    io::sys_close(fresh);
    io::sys_close(lfid);

    // Listener closed under a blocked accept.
    let doomed = socket::sys_socket(600);
    socket::sys_listen(doomed);
    CLOSER_LFID.store(doomed, Ordering::SeqCst);
    let closer = sched::spawn_thread(me, listener_closer_thread);
    sched::wakeup(closer);
    t.check("blocked accept fails once the listener dies", socket::sys_accept(doomed) == NOFILE);
    t.check("connect after listener death fails", {
        let c = socket::sys_socket(0);
        let rv = socket::sys_connect(c, 600, 50);
        io::sys_close(c);
        rv == -1
    });

    // Directional shutdown over a live peer pair.
    let pair_lfid = socket::sys_socket(700);
    socket::sys_listen(pair_lfid);
    PAIR_LFID.store(pair_lfid, Ordering::SeqCst);
    PAIR_ACCEPTED.store(-2, Ordering::SeqCst);
    let pair_accepter = sched::spawn_thread(me, pair_accepter_thread);
    sched::wakeup(pair_accepter);

    let cfid = socket::sys_socket(0);
    t.check("pair connect succeeds", socket::sys_connect(cfid, 700, 1000) == 0);
    let mut waited = 0;
    while PAIR_ACCEPTED.load(Ordering::SeqCst) == -2 && waited < 200 {
        sched::sleep_ms(5);
        waited += 1;
    }
    let sfid = PAIR_ACCEPTED.load(Ordering::SeqCst) as Fid;
    t.check("pair accept produced a peer", sfid >= 0);

    let mut buf = [0u8; 4];
    t.check("client-to-server bytes flow", io::sys_write(cfid, b"abcd") == 4 && io::sys_read(sfid, &mut buf) == 4 && &buf == b"abcd");
    t.check("server-to-client bytes flow", io::sys_write(sfid, b"efgh") == 4 && io::sys_read(cfid, &mut buf) == 4 && &buf == b"efgh");

    socket::sys_shutdown(cfid, ShutdownMode::WRITE);
    t.check("half-closed direction reads EOF", io::sys_read(sfid, &mut buf) == 0);
    t.check("writes on the shut half fail", io::sys_write(cfid, b"late") == -1);
    t.check("other direction still flows", io::sys_write(sfid, b"ok!!") == 4 && io::sys_read(cfid, &mut buf) == 4);

    socket::sys_shutdown(cfid, ShutdownMode::READ);
    t.check("shut read half refuses reads", io::sys_read(cfid, &mut buf) == -1);

    io::sys_close(cfid);
    io::sys_close(sfid);
    io::sys_close(pair_lfid);

    (t.passed, t.failed)
}
