//! A multi-tenant connection pool.
//!
//! One pool serves many targets (databases, tenants, shards) from a single
//! global connection budget. Each target owns a block of connections, and a
//! balancer divides the budget between blocks by estimated demand.
pub(crate) mod algo;
pub(crate) mod block;
pub(crate) mod conn;
pub(crate) mod demand;
pub(crate) mod drain;
pub(crate) mod metrics;
pub(crate) mod pool;
pub(crate) mod waitqueue;

mod time {
    #[cfg(not(test))]
    pub use std::time::Instant;
    #[cfg(test)]
    pub use tokio::time::Instant;
}

// Public interface

pub use algo::PoolConstraints;
pub use block::BlockState;
pub use conn::{ConnError, ConnId, ConnResult, Connector};
pub use demand::EstimatorConfig;
pub use metrics::{BlockMetrics, MetricVariant, PoolMetrics, VariantArray};
pub use pool::{ConfigError, Pool, PoolConfig, PoolHandle};

#[cfg(test)]
pub mod test;
