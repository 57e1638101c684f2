//! TTL cache with offline fallback reads.
//!
//! This module provides the mechanism only: keyed storage with explicit
//! expiry, strict reads that treat expired entries as misses, and an
//! ignore-expiration read for degraded operation. The policy of *when* to
//! read ignoring expiration (offline, camp mode) lives with the callers,
//! chiefly the cached remote reader.

mod keys;
mod store;

pub use keys::ResourceKey;
pub use store::{CacheEntry, CacheStore};

pub(crate) use store::parse_datetime;
