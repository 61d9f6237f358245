//! Utility modules for configuration, error handling, bounded caches and
//! keyed locks.

pub mod cache;
pub mod config;
pub mod errors;
pub mod locks;

pub use cache::BoundedCache;
pub use config::*;
pub use errors::*;
pub use locks::{KeyedGuard, KeyedLocks};
