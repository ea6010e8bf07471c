//! Shared error type for `kvd`.
//!
//! Setup-time failures only — bind errors, thread-spawn failures,
//! programmer-contract violations like double-starting the pool.
//! Per-operation results (cache hit/miss, pool admission refused) are
//! plain `bool`/`Option`, never routed through here.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Binding or listening on a socket failed.
    Bind(std::io::Error),
    /// A non-blocking socket operation failed unexpectedly.
    Io(std::io::Error),
    /// Spawning an OS thread failed.
    ThreadSpawn(std::io::Error),
    /// `WorkerPool::start` called while already running.
    AlreadyRunning,
    /// `WorkerPool::start` called with `low == 0` and no degenerate-case
    /// handling requested.
    NoInitialWorkers,
    /// The mio readiness facility reported a fatal error.
    Reactor(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "bind/listen failed: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::ThreadSpawn(e) => write!(f, "failed to spawn thread: {e}"),
            Self::AlreadyRunning => write!(f, "pool is already running"),
            Self::NoInitialWorkers => write!(f, "pool started with low=0 and no workers to run it"),
            Self::Reactor(e) => write!(f, "reactor error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind(e) | Self::Io(e) | Self::ThreadSpawn(e) | Self::Reactor(e) => Some(e),
            Self::AlreadyRunning | Self::NoInitialWorkers => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        let e = Error::AlreadyRunning;
        assert_eq!(e.to_string(), "pool is already running");
    }

    #[test]
    fn io_errors_carry_source() {
        use std::error::Error as _;
        let e = Error::Bind(std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"));
        assert!(e.source().is_some());
    }
}
