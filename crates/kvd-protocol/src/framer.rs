//! The framing contract plus one concrete grammar.
//!
//! Grounded on the header-then-payload parsing shape of
//! `cmd/httpd/rust/ksvc/src/main.rs::parse_request`: recognize a
//! CRLF-terminated header line, decide how many payload bytes follow,
//! and let the caller (the Connection) own buffering and compaction.

use std::fmt;

use crate::command::Command;

/// Malformed input encountered while framing a command header.
///
/// Carries no detail beyond "malformed" — the `"(?^u:ERROR)"` response
/// is the same for every framing failure, so there is nothing for a
/// caller to branch on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameError;

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed command frame")
    }
}

impl std::error::Error for FrameError {}

/// The literal, bit-for-bit framing-error response, kept verbatim
/// rather than "cleaned up" into something more descriptive.
pub const FRAMING_ERROR_RESPONSE: &[u8] = b"(?^u:ERROR)\r\n";

/// Incremental byte-stream → command decoder contract.
///
/// Implementations are expected to be stateful only for the duration of
/// one `parse`/`build` pair; `reset` clears any such in-flight state
/// (used when a connection is recycled or a framing error aborts a
/// partially-built command).
pub trait Framer {
    /// Feed `buffer[..len]`; set `*consumed` to the number of leading
    /// bytes recognized as a complete header. Returns `Ok(true)` iff a
    /// complete header was recognized (a `build` call will now
    /// succeed); `Ok(false)` if more bytes are needed (`*consumed` left
    /// at 0). `Err` signals malformed input.
    fn parse(&mut self, buffer: &[u8], len: usize, consumed: &mut usize) -> Result<bool, FrameError>;

    /// After a successful `parse`, produce the command and report the
    /// byte length of its payload argument (0 if none) via `*arg_bytes`.
    fn build(&mut self, arg_bytes: &mut usize) -> Command;

    /// Diagnostic name of this framer's grammar.
    fn name(&self) -> &str;

    /// Clear any in-flight parse state.
    fn reset(&mut self);
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn tokenize(line: &[u8]) -> Vec<&[u8]> {
    line.split(|&b| b == b' ').filter(|t| !t.is_empty()).collect()
}

fn parse_header(line: &[u8]) -> Result<(Command, usize), FrameError> {
    let tokens = tokenize(line);
    match tokens.as_slice() {
        [b"get", key] => Ok((Command::Get { key: Box::from(*key) }, 0)),
        [b"delete", key] => Ok((Command::Delete { key: Box::from(*key) }, 0)),
        [verb @ (b"put" | b"putifabsent" | b"set"), key, len_tok] => {
            let len: usize = std::str::from_utf8(len_tok)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(FrameError)?;
            let key = Box::from(*key);
            let command = match *verb {
                b"put" => Command::Put { key },
                b"putifabsent" => Command::PutIfAbsent { key },
                b"set" => Command::Set { key },
                _ => unreachable!(),
            };
            Ok((command, len))
        }
        _ => Err(FrameError),
    }
}

struct PendingHeader {
    command: Command,
    arg_bytes: usize,
}

/// The concrete memcached-style text grammar:
///
/// ```text
/// get <key>\r\n
/// put <key> <len>\r\n<len bytes of payload>
/// putifabsent <key> <len>\r\n<len bytes of payload>
/// set <key> <len>\r\n<len bytes of payload>
/// delete <key>\r\n
/// ```
///
/// The trailing CRLF after a payload is the Connection's concern (spec
/// §4.B: "the Connection must also consume two additional trailing
/// bytes"), not this framer's.
#[derive(Default)]
pub struct MemcacheFramer {
    pending: Option<PendingHeader>,
}

impl MemcacheFramer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Framer for MemcacheFramer {
    fn parse(&mut self, buffer: &[u8], len: usize, consumed: &mut usize) -> Result<bool, FrameError> {
        *consumed = 0;
        let data = &buffer[..len];
        let Some(crlf_at) = find_crlf(data) else {
            return Ok(false);
        };
        let (command, arg_bytes) = parse_header(&data[..crlf_at])?;
        self.pending = Some(PendingHeader { command, arg_bytes });
        *consumed = crlf_at + 2;
        Ok(true)
    }

    fn build(&mut self, arg_bytes: &mut usize) -> Command {
        let pending = self
            .pending
            .take()
            .expect("build called without a preceding successful parse");
        *arg_bytes = pending.arg_bytes;
        pending.command
    }

    fn name(&self) -> &str {
        "memcache"
    }

    fn reset(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_header_parses_in_one_chunk() {
        let mut framer = MemcacheFramer::new();
        let line = b"get x\r\n";
        let mut consumed = 0;
        assert_eq!(framer.parse(line, line.len(), &mut consumed), Ok(true));
        assert_eq!(consumed, line.len());
        let mut arg_bytes = 99;
        let cmd = framer.build(&mut arg_bytes);
        assert_eq!(arg_bytes, 0);
        assert_eq!(cmd, Command::Get { key: Box::from(&b"x"[..]) });
    }

    #[test]
    fn header_split_across_two_reads_still_parses() {
        let mut framer = MemcacheFramer::new();
        let first = b"get x\r";
        let mut consumed = 0;
        assert_eq!(framer.parse(first, first.len(), &mut consumed), Ok(false));
        assert_eq!(consumed, 0);

        let second = b"get x\r\n";
        assert_eq!(framer.parse(second, second.len(), &mut consumed), Ok(true));
        assert_eq!(consumed, second.len());
    }

    #[test]
    fn put_header_reports_announced_length() {
        let mut framer = MemcacheFramer::new();
        let line = b"put k 5\r\n";
        let mut consumed = 0;
        assert_eq!(framer.parse(line, line.len(), &mut consumed), Ok(true));
        let mut arg_bytes = 0;
        let cmd = framer.build(&mut arg_bytes);
        assert_eq!(arg_bytes, 5);
        assert_eq!(cmd, Command::Put { key: Box::from(&b"k"[..]) });
    }

    #[test]
    fn putifabsent_and_set_are_recognized() {
        let mut framer = MemcacheFramer::new();
        let line = b"putifabsent k 3\r\n";
        let mut consumed = 0;
        framer.parse(line, line.len(), &mut consumed).unwrap();
        let mut arg_bytes = 0;
        assert_eq!(
            framer.build(&mut arg_bytes),
            Command::PutIfAbsent { key: Box::from(&b"k"[..]) }
        );

        let line = b"set k 3\r\n";
        framer.parse(line, line.len(), &mut consumed).unwrap();
        assert_eq!(framer.build(&mut arg_bytes), Command::Set { key: Box::from(&b"k"[..]) });
    }

    #[test]
    fn unknown_verb_is_a_framing_error() {
        let mut framer = MemcacheFramer::new();
        let line = b"frobnicate k\r\n";
        let mut consumed = 0;
        assert_eq!(framer.parse(line, line.len(), &mut consumed), Err(FrameError));
    }

    #[test]
    fn non_numeric_length_is_a_framing_error() {
        let mut framer = MemcacheFramer::new();
        let line = b"put k abc\r\n";
        let mut consumed = 0;
        assert_eq!(framer.parse(line, line.len(), &mut consumed), Err(FrameError));
    }

    #[test]
    fn missing_key_is_a_framing_error() {
        let mut framer = MemcacheFramer::new();
        let line = b"get\r\n";
        let mut consumed = 0;
        assert_eq!(framer.parse(line, line.len(), &mut consumed), Err(FrameError));
    }

    #[test]
    fn reset_clears_pending_header() {
        let mut framer = MemcacheFramer::new();
        let line = b"get x\r\n";
        let mut consumed = 0;
        framer.parse(line, line.len(), &mut consumed).unwrap();
        framer.reset();
        let mut arg_bytes = 0;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            framer.build(&mut arg_bytes)
        }));
        assert!(result.is_err());
    }

    #[test]
    fn name_identifies_the_grammar() {
        assert_eq!(MemcacheFramer::new().name(), "memcache");
    }
}
