//! Single-ring readiness loop: one `mio::Poll`, one listening socket, one
//! connection slab, one OS thread.
//!
//! Grounded on `pelikan-io-grow-a-cache`'s mio backend
//! (`9ddd0608_..._mio_impl-event_loop.rs.rs`) for the `Poll`/`Events`/
//! `Token`/`Interest` accept-and-dispatch shape, and on
//! `cmd/httpd/rust/ksvc/src/main.rs`'s per-thread-own-listener pattern
//! (`worker_loop` with `SO_REUSEPORT`) for running independent rings
//! that each own a listener bound to the same port.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};

use kvd_cache::Cache;
use kvd_core::Storage;
use kvd_pool::Pool;
use kvd_protocol::MemcacheFramer;

use crate::connection::Connection;

type Conn = Connection<MemcacheFramer, mio::net::TcpStream>;

const LISTENER: Token = Token(usize::MAX);
const WAKE: Token = Token(usize::MAX - 1);

/// How a ring hands I/O-readiness events off to connection work.
///
/// The reactor either drives `Connection` callbacks directly on the I/O
/// thread, or submits per-connection work to the pool — the pool
/// dispatcher requires a per-connection lock since pool threads may run
/// concurrently with each other and with the ring.
pub enum Dispatch {
    /// The ring thread itself calls `do_read`/`do_write`. Gives
    /// per-connection FIFO response ordering for free: one thread, one
    /// event at a time.
    Inline,
    /// Readiness events become `Task`s submitted to a worker pool.
    Pooled(Pool),
}

/// A spawned ring's handle: request shutdown, or wait for it to drain.
pub struct RingHandle {
    thread: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl RingHandle {
    /// Signal the ring to stop accepting and exit once in-flight I/O
    /// quiesces. Does not block.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.waker.wake();
    }

    /// Block until the ring thread has exited.
    pub fn join(mut self) {
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// Bind a non-blocking, dual-stack-capable listener with `SO_REUSEPORT`
/// set, so multiple independent rings can share one port — the
/// multi-ring idiom from `cmd/httpd/rust/ksvc/src/main.rs::setup_listener`
/// /`create_listener_with_reuseport`, generalized from raw `libc` socket
/// calls to `socket2`.
pub fn bind_reuseport(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    if let SocketAddr::V6(_) = addr {
        // Dual-stack: accept IPv4-mapped connections on the same socket.
        let _ = socket.set_only_v6(false);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Spawn one ring on its own OS thread: register `std_listener` with a
/// fresh `mio::Poll`, then run the accept/dispatch loop until `stop` is
/// called.
pub fn spawn_ring(
    id: usize,
    std_listener: std::net::TcpListener,
    cache: Arc<Mutex<Cache>>,
    dispatch: Dispatch,
) -> io::Result<RingHandle> {
    let mut poll = Poll::new()?;
    let mut listener = TcpListener::from_std(std_listener);
    poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
    let running = Arc::new(AtomicBool::new(true));

    let running_for_thread = running.clone();
    let waker_for_thread = waker.clone();

    let thread = thread::Builder::new().name(format!("kvd-ring-{id}")).spawn(move || {
        match dispatch {
            Dispatch::Inline => inline_ring_loop(id, poll, listener, cache, running_for_thread),
            Dispatch::Pooled(pool) => {
                pooled_ring_loop(id, poll, listener, cache, pool, running_for_thread, waker_for_thread)
            }
        }
    })?;

    Ok(RingHandle { thread: Some(thread), running, waker })
}

fn inline_ring_loop(
    id: usize,
    mut poll: Poll,
    mut listener: TcpListener,
    cache: Arc<Mutex<Cache>>,
    running: Arc<AtomicBool>,
) {
    let mut events = Events::with_capacity(256);
    let mut connections: Slab<Conn> = Slab::with_capacity(1024);

    tracing::info!(ring = id, "ring running (inline dispatch)");

    while running.load(Ordering::SeqCst) {
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(250))) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(ring = id, error = %e, "poll failed");
            break;
        }

        for event in events.iter() {
            match event.token() {
                WAKE => {}
                LISTENER => accept_inline(id, &mut listener, &mut poll, &mut connections),
                Token(idx) => handle_inline_event(id, idx, event, &mut poll, &mut connections, &cache),
            }
        }
    }

    for (_, conn) in connections.iter_mut() {
        conn.on_close();
    }
    tracing::info!(ring = id, "ring stopped");
}

fn accept_inline(id: usize, listener: &mut TcpListener, poll: &mut Poll, connections: &mut Slab<Conn>) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let mut conn = Conn::new(stream);
                conn.start();
                let entry = connections.vacant_entry();
                let token = Token(entry.key());
                if let Err(e) = poll.registry().register(&mut conn.stream, token, conn.interest()) {
                    tracing::warn!(ring = id, error = %e, "failed to register accepted connection");
                    continue;
                }
                tracing::debug!(ring = id, peer = %peer, token = token.0, "accepted connection");
                entry.insert(conn);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::warn!(ring = id, error = %e, "accept failed");
                break;
            }
        }
    }
}

fn handle_inline_event(
    id: usize,
    idx: usize,
    event: &Event,
    poll: &mut Poll,
    connections: &mut Slab<Conn>,
    cache: &Arc<Mutex<Cache>>,
) {
    if !connections.contains(idx) {
        return;
    }

    if event.is_read_closed() || event.is_error() {
        connections[idx].on_error();
    } else {
        if event.is_readable() {
            let mut storage = cache.lock().unwrap();
            if let Err(e) = connections[idx].do_read(&mut *storage as &mut dyn Storage) {
                tracing::debug!(ring = id, token = idx, error = %e, "read error");
            }
        }
        if connections.contains(idx) && event.is_writable() {
            if let Err(e) = connections[idx].do_write() {
                tracing::debug!(ring = id, token = idx, error = %e, "write error");
            }
        }
    }

    if !connections.contains(idx) {
        return;
    }

    if !connections[idx].is_alive() && connections[idx].is_drained() {
        let mut conn = connections.remove(idx);
        let _ = poll.registry().deregister(&mut conn.stream);
    } else {
        let interest = connections[idx].interest();
        let _ = poll.registry().reregister(&mut connections[idx].stream, Token(idx), interest);
    }
}

/// Pooled-dispatch variant: readiness events are wrapped as `Task`s run
/// on `pool`, behind a per-connection `Mutex` since pool threads race
/// each other and the ring thread for the same socket. Completion is
/// reported back to the ring through a channel plus the ring's own
/// `Waker`, since reregistration/deregistration of the slab entry is
/// kept on the ring thread alongside `accept`.
fn pooled_ring_loop(
    id: usize,
    mut poll: Poll,
    mut listener: TcpListener,
    cache: Arc<Mutex<Cache>>,
    pool: Pool,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
) {
    use kvd_core::WorkerPool as _;

    let mut events = Events::with_capacity(256);
    let mut connections: Slab<Arc<Mutex<Conn>>> = Slab::with_capacity(1024);
    let (done_tx, done_rx) = mpsc::channel::<usize>();

    tracing::info!(ring = id, "ring running (pooled dispatch)");

    while running.load(Ordering::SeqCst) {
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(250))) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(ring = id, error = %e, "poll failed");
            break;
        }

        for event in events.iter() {
            match event.token() {
                WAKE => {
                    while let Ok(idx) = done_rx.try_recv() {
                        if connections.contains(idx) {
                            connections.remove(idx);
                        }
                    }
                }
                LISTENER => accept_pooled(id, &mut listener, poll.registry(), &mut connections),
                Token(idx) => {
                    if !connections.contains(idx) {
                        continue;
                    }
                    let handle = connections[idx].clone();
                    let cache = cache.clone();
                    let registry = match poll.registry().try_clone() {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(ring = id, error = %e, "registry clone failed");
                            continue;
                        }
                    };
                    let done_tx = done_tx.clone();
                    let task_waker = waker.clone();
                    let readable = event.is_readable();
                    let writable = event.is_writable();
                    let errored = event.is_read_closed() || event.is_error();

                    let submitted = pool.execute(Box::new(move || {
                        let mut conn = handle.lock().unwrap();
                        if errored {
                            conn.on_error();
                        } else {
                            if readable {
                                let mut storage = cache.lock().unwrap();
                                let _ = conn.do_read(&mut *storage as &mut dyn Storage);
                            }
                            if writable && conn.is_alive() {
                                let _ = conn.do_write();
                            }
                        }

                        if !conn.is_alive() && conn.is_drained() {
                            let _ = registry.deregister(&mut conn.stream);
                            drop(conn);
                            let _ = done_tx.send(idx);
                        } else {
                            let interest = conn.interest();
                            let _ = registry.reregister(&mut conn.stream, Token(idx), interest);
                        }
                        let _ = task_waker.wake();
                    }));

                    if !submitted {
                        tracing::warn!(ring = id, token = idx, "pool saturated, dropping readiness event");
                    }
                }
            }
        }
    }

    for (_, conn) in connections.iter() {
        conn.lock().unwrap().on_close();
    }
    tracing::info!(ring = id, "ring stopped");
}

fn accept_pooled(
    id: usize,
    listener: &mut TcpListener,
    registry: &mio::Registry,
    connections: &mut Slab<Arc<Mutex<Conn>>>,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let mut conn = Conn::new(stream);
                conn.start();
                let entry = connections.vacant_entry();
                let token = Token(entry.key());
                if let Err(e) = registry.register(&mut conn.stream, token, conn.interest()) {
                    tracing::warn!(ring = id, error = %e, "failed to register accepted connection");
                    continue;
                }
                tracing::debug!(ring = id, peer = %peer, token = token.0, "accepted connection");
                entry.insert(Arc::new(Mutex::new(conn)));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::warn!(ring = id, error = %e, "accept failed");
                break;
            }
        }
    }
}
