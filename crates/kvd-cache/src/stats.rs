//! Read-only diagnostics snapshot.
//!
//! Never affects eviction or recency behavior — grounded on the plain
//! counter-struct idiom of `ksvc_module::fixed_pool` and the
//! `Stats::print` snapshot in `ksvc-httpd`.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub current_bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}
