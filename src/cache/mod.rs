//! Stale-while-revalidate read cache.
//!
//! This module provides an in-memory cache for remote reads that:
//! - Serves fresh entries without touching the network
//! - Serves stale entries immediately and refreshes them in the background
//! - Retries failed fetches with linear backoff
//! - Keeps only the newest fetch per key, aborting superseded ones
//! - Evicts entries past their cache time on a periodic sweep

mod engine;
mod entry;
mod key;
mod types;

pub use engine::{CacheEngine, Subscription};
pub use entry::{CacheEntry, Freshness};
pub use key::QueryKey;
pub use types::{CacheOptions, QueryResult, QueryStatus};
