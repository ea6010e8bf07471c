//! `kvd-server`: the server facade binary — CLI/env configuration,
//! logging, signal handling, and `kvd-net::Server`'s bind/start/stop/join
//! lifecycle wired together.
//!
//! Grounded on the httpd binaries `cmd/httpd/rust/gvthread1/src/main.rs`
//! and `cmd/httpd/rust/ksvc/src/main.rs`: a `RUNNING` atomic flipped by
//! `libc::signal`, a periodic stats report, and a final drain-then-exit
//! sequence.
//!
//! ```text
//! kvd-server [--port 11311] [--cache-bytes 67108864] [--network mt-nonblock]
//! printf 'put k 3\r\nabc\r\nget k\r\n' | nc 127.0.0.1 11311
//! ```

mod config;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kvd_net::{Server, ServerConfig};

static RUNNING: AtomicBool = AtomicBool::new(true);

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

extern "C" fn handle_shutdown_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_shutdown_signal as usize);
        libc::signal(libc::SIGTERM, handle_shutdown_signal as usize);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn main() {
    init_tracing();
    install_signal_handlers();

    let args = config::Args::parse();
    let server_config = ServerConfig {
        addr: args.bind_addr(),
        cache_bytes: args.cache_bytes as usize,
        flavor: args.flavor,
        n_accept: args.accept_threads,
        pool: args.pool_config(),
        backlog: config::DEFAULT_BACKLOG,
    };
    let flavor = server_config.flavor;

    tracing::info!(
        port = args.port,
        cache_bytes = args.cache_bytes,
        flavor = ?flavor,
        "starting kvd-server"
    );

    let server = match Server::start(server_config) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    std::thread::scope(|scope| {
        scope.spawn(|| stats_loop(&server));

        while RUNNING.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(200));
        }
    });

    tracing::info!("shutdown signal received, draining connections");
    server.stop();
    server.join();
    tracing::info!("kvd-server: shutdown complete");
}

/// Log cache stats every five seconds until shutdown. Runs on its own
/// thread so the main thread is free to just watch `RUNNING`.
fn stats_loop(server: &Server) {
    let mut last = std::time::Instant::now();
    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        if last.elapsed() < Duration::from_secs(5) {
            continue;
        }
        last = std::time::Instant::now();
        let stats = server.cache_stats();
        tracing::info!(
            entries = stats.entries,
            bytes = stats.current_bytes,
            max_bytes = stats.max_bytes,
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            "cache stats"
        );
    }
}
