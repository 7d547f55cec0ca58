//! Client-side data access for a storefront backed by a hosted
//! database/auth/storage service.
//!
//! - [`connection`]: one shared client handle, session recovery, health checks
//! - [`cache`]: stale-while-revalidate reads
//! - [`mutation`]: batched, transactional and bulk writes
//! - [`backend`]: the service API and its HTTP implementation

pub mod backend;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod mutation;
pub mod resilience;

pub use backend::{Backend, Filter, FilterOp, RestBackend, Row, Select, Session};
pub use cache::{CacheEngine, CacheOptions, QueryKey, QueryResult, QueryStatus};
pub use config::Config;
pub use connection::{ConnectionManager, ConnectionStats, ConnectionStatus, Handle};
pub use error::{DataError, Result};
pub use mutation::{Mutation, MutationCoordinator, PerformanceStats};
