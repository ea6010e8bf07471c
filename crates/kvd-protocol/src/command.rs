//! Command objects produced by a [`crate::Framer`] and their execution
//! against a [`kvd_core::Storage`].
//!
//! Grounded on the `VALUE ... END` response shape and the
//! STORED/NOT_STORED/DELETED/NOT_FOUND verbs standard to
//! memcached-style text protocols.

use kvd_core::Storage;

/// A fully-parsed command header, awaiting its argument (if any).
///
/// `Get`/`Delete` never carry an argument; `build` reports `arg_bytes
/// == 0` for them. The others carry the payload announced by their
/// length field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: Box<[u8]> },
    Delete { key: Box<[u8]> },
    Put { key: Box<[u8]> },
    PutIfAbsent { key: Box<[u8]> },
    Set { key: Box<[u8]> },
}

impl Command {
    /// Run this command against `storage`, appending the wire response
    /// to `result` (the Connection's write-queue entry).
    ///
    /// `argument` is the payload already assembled by the Connection;
    /// empty for `Get`/`Delete`.
    pub fn execute(&self, storage: &mut dyn Storage, argument: &[u8], result: &mut Vec<u8>) {
        match self {
            Command::Get { key } => match storage.get(key) {
                Some(value) => {
                    result.extend_from_slice(b"VALUE ");
                    result.extend_from_slice(key);
                    result.extend_from_slice(b" 0 ");
                    result.extend_from_slice(value.len().to_string().as_bytes());
                    result.extend_from_slice(b"\r\n");
                    result.extend_from_slice(&value);
                    result.extend_from_slice(b"\r\nEND\r\n");
                }
                None => result.extend_from_slice(b"END\r\n"),
            },
            Command::Delete { key } => {
                if storage.delete(key) {
                    result.extend_from_slice(b"DELETED\r\n");
                } else {
                    result.extend_from_slice(b"NOT_FOUND\r\n");
                }
            }
            Command::Put { key } => push_stored(result, storage.put(key, argument)),
            Command::PutIfAbsent { key } => {
                push_stored(result, storage.put_if_absent(key, argument))
            }
            Command::Set { key } => push_stored(result, storage.set(key, argument)),
        }
    }
}

fn push_stored(result: &mut Vec<u8>, stored: bool) {
    if stored {
        result.extend_from_slice(b"STORED\r\n");
    } else {
        result.extend_from_slice(b"NOT_STORED\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvd_core::ByteString;

    struct FakeStore {
        value: Option<ByteString>,
        accept: bool,
    }

    impl Storage for FakeStore {
        fn put(&mut self, _key: &[u8], value: &[u8]) -> bool {
            if self.accept {
                self.value = Some(Box::from(value));
            }
            self.accept
        }
        fn put_if_absent(&mut self, key: &[u8], value: &[u8]) -> bool {
            self.put(key, value)
        }
        fn set(&mut self, key: &[u8], value: &[u8]) -> bool {
            self.put(key, value)
        }
        fn delete(&mut self, _key: &[u8]) -> bool {
            self.accept
        }
        fn get(&mut self, _key: &[u8]) -> Option<ByteString> {
            self.value.clone()
        }
    }

    #[test]
    fn get_hit_produces_exact_value_response() {
        let mut store = FakeStore { value: Some(Box::from(&b"1"[..])), accept: true };
        let mut out = Vec::new();
        Command::Get { key: Box::from(&b"x"[..]) }.execute(&mut store, b"", &mut out);
        assert_eq!(out, b"VALUE x 0 1\r\n1\r\nEND\r\n");
    }

    #[test]
    fn get_miss_is_end_only() {
        let mut store = FakeStore { value: None, accept: true };
        let mut out = Vec::new();
        Command::Get { key: Box::from(&b"x"[..]) }.execute(&mut store, b"", &mut out);
        assert_eq!(out, b"END\r\n");
    }

    #[test]
    fn put_reports_stored_or_not_stored() {
        let mut out = Vec::new();
        let mut rejecting = FakeStore { value: None, accept: false };
        Command::Put { key: Box::from(&b"k"[..]) }.execute(&mut rejecting, b"v", &mut out);
        assert_eq!(out, b"NOT_STORED\r\n");

        out.clear();
        let mut accepting = FakeStore { value: None, accept: true };
        Command::Put { key: Box::from(&b"k"[..]) }.execute(&mut accepting, b"v", &mut out);
        assert_eq!(out, b"STORED\r\n");
    }

    #[test]
    fn delete_reports_deleted_or_not_found() {
        let mut out = Vec::new();
        let mut store = FakeStore { value: None, accept: true };
        Command::Delete { key: Box::from(&b"k"[..]) }.execute(&mut store, b"", &mut out);
        assert_eq!(out, b"DELETED\r\n");

        out.clear();
        let mut store = FakeStore { value: None, accept: false };
        Command::Delete { key: Box::from(&b"k"[..]) }.execute(&mut store, b"", &mut out);
        assert_eq!(out, b"NOT_FOUND\r\n");
    }
}
