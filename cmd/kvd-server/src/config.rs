//! CLI + environment-variable configuration.
//!
//! Grounded on the `gvt_app_*`-env-then-CLI-override pattern of
//! `cmd/httpd/rust/gvthread1/src/main.rs::main`: environment variables
//! set the baseline, command-line flags override them, and unknown or
//! malformed values are ignored rather than rejected outright, matching
//! that file's forgiving flag loop.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use kvd_net::NetworkFlavor;
use kvd_pool::PoolConfig;

pub const DEFAULT_PORT: u16 = 11311;
pub const DEFAULT_CACHE_BYTES: u64 = 64 * 1024 * 1024;
pub const DEFAULT_BACKLOG: i32 = 128;
pub const DEFAULT_ACCEPT_THREADS: usize = 4;

pub struct Args {
    pub port: u16,
    pub cache_bytes: u64,
    pub flavor: NetworkFlavor,
    pub accept_threads: usize,
    pub low_workers: usize,
    pub high_workers: usize,
    pub queue_cap: usize,
    pub idle_ms: u64,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            cache_bytes: DEFAULT_CACHE_BYTES,
            flavor: NetworkFlavor::MultiThreadedNonBlocking,
            accept_threads: DEFAULT_ACCEPT_THREADS,
            low_workers: 4,
            high_workers: 16,
            queue_cap: 128,
            idle_ms: 1000,
        }
    }
}

impl Args {
    pub fn parse() -> Self {
        let mut args = Self::default();
        args.apply_env();
        args.apply_cli(std::env::args().skip(1).collect());
        args
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("kvd_port") {
            if let Ok(p) = v.parse() {
                self.port = p;
            }
        }
        if let Ok(v) = std::env::var("kvd_cache_bytes") {
            if let Ok(b) = v.parse() {
                self.cache_bytes = b;
            }
        }
        if let Ok(v) = std::env::var("kvd_network") {
            if let Some(f) = parse_flavor(&v) {
                self.flavor = f;
            }
        }
        if let Ok(v) = std::env::var("kvd_accept_threads") {
            if let Ok(n) = v.parse() {
                self.accept_threads = n;
            }
        }
        if let Ok(v) = std::env::var("kvd_workers") {
            if let Ok(n) = v.parse::<usize>() {
                self.low_workers = n;
                self.high_workers = n.saturating_mul(4).max(n);
            }
        }
    }

    fn apply_cli(&mut self, raw: Vec<String>) {
        let mut i = 0;
        while i < raw.len() {
            match raw[i].as_str() {
                "--port" | "-p" => self.take_next(&raw, &mut i, |s: &mut Self, v: u16| s.port = v),
                "--cache-bytes" => self.take_next(&raw, &mut i, |s: &mut Self, v: u64| s.cache_bytes = v),
                "--network" => {
                    i += 1;
                    if let Some(v) = raw.get(i).and_then(|v| parse_flavor(v)) {
                        self.flavor = v;
                    }
                }
                "--accept-threads" => {
                    self.take_next(&raw, &mut i, |s: &mut Self, v: usize| s.accept_threads = v)
                }
                "--low-workers" => self.take_next(&raw, &mut i, |s: &mut Self, v: usize| s.low_workers = v),
                "--high-workers" => self.take_next(&raw, &mut i, |s: &mut Self, v: usize| s.high_workers = v),
                "--queue-cap" => self.take_next(&raw, &mut i, |s: &mut Self, v: usize| s.queue_cap = v),
                "--idle-ms" => self.take_next(&raw, &mut i, |s: &mut Self, v: u64| s.idle_ms = v),
                _ => {}
            }
            i += 1;
        }
    }

    /// Parse `raw[i + 1]` and, on success, assign it via `set`; advances
    /// `i` past the consumed value either way.
    fn take_next<T: std::str::FromStr>(&mut self, raw: &[String], i: &mut usize, set: impl FnOnce(&mut Self, T)) {
        *i += 1;
        if let Some(v) = raw.get(*i).and_then(|s| s.parse::<T>().ok()) {
            set(self, v);
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), self.port)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            low: self.low_workers,
            high: self.high_workers.max(self.low_workers),
            queue_cap: self.queue_cap,
            idle_ms: self.idle_ms,
        }
    }
}

fn parse_flavor(s: &str) -> Option<NetworkFlavor> {
    match s {
        "st" => Some(NetworkFlavor::SingleThreaded),
        "mt" => Some(NetworkFlavor::MultiThreaded),
        "mt-nonblock" => Some(NetworkFlavor::MultiThreadedNonBlocking),
        _ => None,
    }
}
