//! # Utility Modules
//!
//! Supporting pieces shared by the transport and the modules.
//!
//! ## Components
//! - **Pool**: fixed-size blocking pool for external resource handles
//! - **Metrics**: thread-safe observability counters
//! - **Logging**: `tracing-subscriber` setup

pub mod logging;
pub mod metrics;
pub mod pool;

pub use metrics::{Metrics, MetricsSnapshot};
pub use pool::{ConnectionPool, PooledConnection};
