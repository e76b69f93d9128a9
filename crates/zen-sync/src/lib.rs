//! External task synchronization for `zen`.
//!
//! [`SyncEngine`] links local tasks to records in an external system and
//! moves changes in either direction, guarded per provider by a
//! [`CircuitBreaker`] and a [`TokenBucket`].

pub mod breaker;
pub mod conflict;
pub mod engine;
pub mod health;
pub mod metrics;
pub mod ratelimit;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitState};
pub use engine::{SyncEngine, SyncOptions, SyncResult};
pub use metrics::SyncMetrics;
pub use ratelimit::TokenBucket;
pub use retry::{retry, RetryPolicy};
