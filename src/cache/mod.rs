//! In-process cache with per-entry expiration.

mod ttl;

pub use ttl::{TtlCache, PERMANENT_TTL};
