//! Multi-algorithm file hashing: the strategy registry and the
//! cache-backed hashing service.
//!
//! The registry ([`HashRegistry`]) dispatches over pluggable
//! [`HashStrategy`](strategies::HashStrategy) implementations; the
//! service ([`HashingService`]) computes all requested digests for a
//! file in one read pass, consulting the per-store
//! [`hash_cache`](crate::store::hash_cache) first.

pub mod registry;
pub mod service;
pub mod strategies;

pub use registry::HashRegistry;
pub use service::HashingService;
