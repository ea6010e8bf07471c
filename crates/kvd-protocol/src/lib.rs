//! Protocol framing contract plus a concrete memcached-style text
//! grammar.

mod command;
mod framer;

pub use command::Command;
pub use framer::{FrameError, Framer, MemcacheFramer, FRAMING_ERROR_RESPONSE};
