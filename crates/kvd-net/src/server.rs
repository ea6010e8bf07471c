//! Compose the cache, pool, and reactor rings into one bind/start/stop/join
//! facade.
//!
//! Grounded on `cmd/httpd/rust/ksvc/src/main.rs`'s multi-ring
//! `SO_REUSEPORT` worker model (`worker_loop`s fanned out over
//! `--threads`), generalized from per-ring io_uring instances to
//! per-ring `mio::Poll` instances sharing one `Arc<Mutex<Cache>>`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use kvd_cache::{Cache, CacheStats};
use kvd_core::WorkerPool as _;
use kvd_error::{Error, Result};
use kvd_pool::{Pool, PoolConfig};

use crate::reactor::{self, Dispatch, RingHandle};

/// Selects how readiness work is dispatched, mirroring the `--network`
/// flag's `st`/`mt`/`mt-nonblock` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFlavor {
    /// One ring, inline dispatch: the ring thread runs every
    /// `Connection::do_read`/`do_write` itself.
    SingleThreaded,
    /// One ring, pooled dispatch: readiness events become `Task`s run on
    /// a worker pool behind a per-connection mutex.
    MultiThreaded,
    /// `n_accept` independent rings, each with its own `SO_REUSEPORT`
    /// listener and inline dispatch. The default: no shared mutable
    /// state between rings except the cache.
    MultiThreadedNonBlocking,
}

pub struct ServerConfig {
    pub addr: SocketAddr,
    pub cache_bytes: usize,
    pub flavor: NetworkFlavor,
    /// Ring count for `MultiThreadedNonBlocking`; ignored otherwise.
    pub n_accept: usize,
    pub pool: PoolConfig,
    pub backlog: i32,
}

/// A running server: one cache, zero-or-one worker pool, one-or-more
/// reactor rings.
pub struct Server {
    rings: Vec<RingHandle>,
    pool: Option<Pool>,
    cache: Arc<Mutex<Cache>>,
    local_addr: SocketAddr,
}

impl Server {
    pub fn start(config: ServerConfig) -> Result<Self> {
        let cache = Arc::new(Mutex::new(Cache::new(config.cache_bytes)));

        let pool = match config.flavor {
            NetworkFlavor::MultiThreaded => {
                let pool = Pool::new(config.pool);
                pool.start().map_err(|_| Error::AlreadyRunning)?;
                Some(pool)
            }
            NetworkFlavor::SingleThreaded | NetworkFlavor::MultiThreadedNonBlocking => None,
        };

        let n_rings = match config.flavor {
            NetworkFlavor::MultiThreadedNonBlocking => config.n_accept.max(1),
            NetworkFlavor::SingleThreaded | NetworkFlavor::MultiThreaded => 1,
        };

        let mut rings = Vec::with_capacity(n_rings);
        let mut local_addr = None;
        for id in 0..n_rings {
            let std_listener = reactor::bind_reuseport(config.addr, config.backlog).map_err(Error::Bind)?;
            if local_addr.is_none() {
                local_addr = Some(std_listener.local_addr().map_err(Error::Bind)?);
            }
            let dispatch = match &pool {
                Some(p) => Dispatch::Pooled(p.clone()),
                None => Dispatch::Inline,
            };
            let ring =
                reactor::spawn_ring(id, std_listener, cache.clone(), dispatch).map_err(Error::Reactor)?;
            rings.push(ring);
        }

        let local_addr = local_addr.expect("at least one ring is always spawned");
        tracing::info!(
            addr = %local_addr,
            rings = n_rings,
            flavor = ?config.flavor,
            cache_bytes = config.cache_bytes,
            "server started"
        );

        Ok(Self { rings, pool, cache, local_addr })
    }

    /// The address actually bound — useful when `addr`'s port was `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().unwrap().stats()
    }

    /// Signal every ring (and the pool, if any) to stop. Does not block.
    pub fn stop(&self) {
        for ring in &self.rings {
            ring.stop();
        }
        if let Some(pool) = &self.pool {
            pool.stop(false);
        }
    }

    /// Block until every ring thread has exited and the pool (if any)
    /// has drained.
    pub fn join(mut self) {
        for ring in self.rings.drain(..) {
            ring.join();
        }
        if let Some(pool) = self.pool.take() {
            pool.stop(true);
        }
    }
}
