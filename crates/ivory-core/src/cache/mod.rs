//! Caching layer for ivory-core
//!
//! Memoizes derived aggregates with soft/hard TTL and single-flight dedup.

pub mod coordinator;

pub use coordinator::{CacheCoordinator, CacheStats};
