//! Per-socket read/parse/execute/write state machine.
//!
//! Grounded on `pelikan-io-grow-a-cache`'s `ConnState`/buffer-offset
//! shape (`9ddd0608_..._mio_impl-event_loop.rs.rs`'s `Reading{filled}`/
//! `Writing{written,total}`) for the edge-triggered read/write cycle,
//! generalized over the socket type (`S: Read + Write`) so the state
//! machine itself can be exercised in tests without a real TCP socket.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};

use kvd_core::Storage;
use kvd_protocol::{Command, FrameError, Framer, FRAMING_ERROR_RESPONSE};
use mio::Interest;

const READ_BUF_SIZE: usize = 4096;

/// Trailing CRLF the Connection consumes after a payload but never
/// stores: the two bytes following the announced argument length.
const ARG_TERMINATOR_LEN: usize = 2;

/// The implicit per-connection state machine.
enum Phase {
    NeedCommand,
    NeedArgs { command: Command, argument: Vec<u8>, arg_remains: usize },
    ReadyToExecute { command: Command, argument: Vec<u8> },
}

/// A single client connection: buffers, framer, write queue, liveness.
///
/// Owned by the reactor for its lifetime; destroyed after the socket is
/// closed AND all enqueued writes are drained or failed.
pub struct Connection<F, S> {
    pub(crate) stream: S,
    framer: F,
    phase: Phase,
    read_buf: Box<[u8]>,
    filled: usize,
    write_queue: VecDeque<Vec<u8>>,
    written: usize,
    interest: Interest,
    alive: bool,
}

impl<F, S> Connection<F, S>
where
    F: Framer + Default,
    S: Read + Write,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            framer: F::default(),
            phase: Phase::NeedCommand,
            read_buf: vec![0u8; READ_BUF_SIZE].into_boxed_slice(),
            filled: 0,
            write_queue: VecDeque::new(),
            written: 0,
            interest: Interest::READABLE,
            alive: true,
        }
    }

    /// Called once, immediately after construction and registration.
    /// Nothing to initialize beyond what `new` already does; kept as an
    /// explicit hook alongside the rest of the connection's public API.
    pub fn start(&mut self) {}

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// True once every enqueued response has been written or abandoned.
    pub fn is_drained(&self) -> bool {
        self.write_queue.is_empty()
    }

    /// The readiness interest the reactor should (re-)register for.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn on_error(&mut self) {
        self.alive = false;
    }

    pub fn on_close(&mut self) {
        self.alive = false;
    }

    /// Edge-triggered read cycle: read until the
    /// peer closes or the socket reports no more data, draining and
    /// executing as many complete commands as the buffer yields.
    pub fn do_read(&mut self, storage: &mut dyn Storage) -> io::Result<()> {
        loop {
            if self.filled == self.read_buf.len() {
                // Buffer full with no recognizable frame: the peer is
                // sending a header/argument longer than we accept.
                self.on_error();
                return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large for read buffer"));
            }
            match self.stream.read(&mut self.read_buf[self.filled..]) {
                Ok(0) => {
                    self.alive = false;
                    return Ok(());
                }
                Ok(n) => {
                    self.filled += n;
                    self.drain_buffer(storage);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.alive = false;
                    return Err(e);
                }
            }
        }
    }

    fn compact(&mut self, consumed: usize) {
        self.read_buf.copy_within(consumed..self.filled, 0);
        self.filled -= consumed;
    }

    /// Repeatedly advance the state machine against buffered bytes
    /// until no more progress can be made: parse a header, collect its
    /// argument bytes, execute, repeat.
    ///
    /// Each iteration takes ownership of the current phase via
    /// `mem::replace` so branch bodies can freely call `&mut self`
    /// helpers (`compact`, `enqueue`) without fighting the borrow
    /// checker over a live reference into `self.phase`.
    fn drain_buffer(&mut self, storage: &mut dyn Storage) {
        loop {
            match std::mem::replace(&mut self.phase, Phase::NeedCommand) {
                Phase::NeedCommand => {
                    let mut consumed = 0usize;
                    match self.framer.parse(&self.read_buf, self.filled, &mut consumed) {
                        Ok(true) => {
                            self.compact(consumed);
                            let mut arg_bytes = 0usize;
                            let command = self.framer.build(&mut arg_bytes);
                            self.phase = if arg_bytes > 0 {
                                Phase::NeedArgs {
                                    command,
                                    argument: Vec::with_capacity(arg_bytes),
                                    arg_remains: arg_bytes + ARG_TERMINATOR_LEN,
                                }
                            } else {
                                Phase::ReadyToExecute { command, argument: Vec::new() }
                            };
                        }
                        Ok(false) => break, // self.phase already NeedCommand
                        Err(FrameError) => {
                            self.enqueue(FRAMING_ERROR_RESPONSE.to_vec());
                            self.framer.reset();
                            self.filled = 0;
                            break;
                        }
                    }
                }
                Phase::NeedArgs { command, mut argument, mut arg_remains } => {
                    if self.filled == 0 {
                        self.phase = Phase::NeedArgs { command, argument, arg_remains };
                        break;
                    }
                    let take = arg_remains.min(self.filled);
                    argument.extend_from_slice(&self.read_buf[..take]);
                    self.compact(take);
                    arg_remains -= take;

                    if arg_remains == 0 {
                        let payload_len = argument.len() - ARG_TERMINATOR_LEN;
                        argument.truncate(payload_len);
                        self.phase = Phase::ReadyToExecute { command, argument };
                    } else {
                        self.phase = Phase::NeedArgs { command, argument, arg_remains };
                        break;
                    }
                }
                Phase::ReadyToExecute { command, argument } => {
                    let mut result = Vec::new();
                    command.execute(storage, &argument, &mut result);
                    self.enqueue(result);
                    self.framer.reset();
                    // self.phase already NeedCommand from the replace above
                }
            }
        }
    }

    fn enqueue(&mut self, response: Vec<u8>) {
        let was_empty = self.write_queue.is_empty();
        self.write_queue.push_back(response);
        if was_empty {
            self.interest = Interest::READABLE | Interest::WRITABLE;
        }
    }

    /// Single vectored write attempt.
    pub fn do_write(&mut self) -> io::Result<()> {
        if self.write_queue.is_empty() {
            self.interest = Interest::READABLE;
            return Ok(());
        }

        let slices: Vec<IoSlice<'_>> = self
            .write_queue
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                if i == 0 {
                    IoSlice::new(&entry[self.written..])
                } else {
                    IoSlice::new(entry)
                }
            })
            .collect();

        match self.stream.write_vectored(&slices) {
            Ok(0) => {
                self.alive = false;
                Err(io::Error::new(io::ErrorKind::WriteZero, "write_vectored returned 0"))
            }
            Ok(written) => {
                self.advance_write_queue(written);
                if self.write_queue.is_empty() {
                    self.interest = Interest::READABLE;
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                self.alive = false;
                Err(e)
            }
        }
    }

    fn advance_write_queue(&mut self, mut written: usize) {
        while written > 0 {
            let Some(head) = self.write_queue.front() else { break };
            let remaining = head.len() - self.written;
            if written >= remaining {
                self.write_queue.pop_front();
                self.written = 0;
                written -= remaining;
            } else {
                self.written += written;
                written = 0;
            }
        }
    }
}
