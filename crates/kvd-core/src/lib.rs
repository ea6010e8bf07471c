//! Cross-cutting trait contracts shared by the `kvd` crates.
//!
//! Mirrors `ksvc-core`'s role: a dependency-free
//! crate of trait definitions that the concrete implementations
//! (`kvd-cache`, `kvd-pool`, `kvd-net`) satisfy, so those crates never
//! need to depend on each other directly.

use std::fmt;

/// A byte-string key or value. Keys are immutable once stored; values
/// are replaced wholesale on update, never mutated in place.
pub type ByteString = Box<[u8]>;

/// The storage interface exposed to command execution.
///
/// All operations return a boolean or optional status; no exceptions.
/// Implementations are *not* required to be internally thread-safe —
/// the server wraps a `Storage` in its own lock.
pub trait Storage {
    /// Upsert. Fails only if `|k|+|v|` exceeds the store's byte budget.
    fn put(&mut self, key: &[u8], value: &[u8]) -> bool;

    /// Insert only if `key` is absent. Same size/eviction discipline as `put`.
    fn put_if_absent(&mut self, key: &[u8], value: &[u8]) -> bool;

    /// Update only if `key` is present; moves the entry to the tail first.
    fn set(&mut self, key: &[u8], value: &[u8]) -> bool;

    /// Remove `key` if present.
    fn delete(&mut self, key: &[u8]) -> bool;

    /// Fetch `key`'s value, refreshing its recency on hit.
    fn get(&mut self, key: &[u8]) -> Option<ByteString>;
}

/// An opaque unit of work submitted to a `WorkerPool`.
///
/// Carries no return channel — result notification, if any, is the
/// closure's own concern (e.g. it can write into a channel it captured).
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The pool interface exposed to the reactor.
pub trait WorkerPool: Send + Sync {
    /// Transition STOPPED → RUNNING, spawning the pool's initial workers.
    ///
    /// # Errors
    /// Fails if the pool is not currently STOPPED.
    fn start(&self) -> Result<(), PoolError>;

    /// Submit a task for execution. Never blocks.
    ///
    /// Returns `false` if the pool is not RUNNING or its bounded queue
    /// is full (backpressure) — never raises for either condition.
    fn execute(&self, task: Task) -> bool;

    /// Transition RUNNING → STOPPING. Idempotent once STOPPED.
    ///
    /// If `await_drain` is true, blocks until every worker has exited
    /// and every previously-admitted task has run.
    fn stop(&self, await_drain: bool);

    /// Number of worker threads currently alive.
    fn workers(&self) -> usize;
}

/// Error returned by [`WorkerPool::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// `start` was called while the pool was already RUNNING or STOPPING.
    AlreadyRunning,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "pool is already running"),
        }
    }
}

impl std::error::Error for PoolError {}
