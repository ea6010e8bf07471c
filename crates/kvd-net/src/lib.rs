//! Per-connection state machine (component C) and mio-based
//! reactor/acceptor (component E), composed into a bind/start/stop/join
//! server facade (component F).

mod connection;
mod reactor;
mod server;

pub use connection::Connection;
pub use reactor::{bind_reuseport, Dispatch, RingHandle};
pub use server::{NetworkFlavor, Server, ServerConfig};
