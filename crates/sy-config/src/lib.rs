//! Configuration model for the switchyard dispatch core.
//!
//! Two blocks are owned here: `load_balance` (the latency-tiered outbound
//! group) and `connection_pool` (pre-established upstream sessions). Both
//! deserialize with serde and carry their defaults as named functions so a
//! partially-specified document always yields a runnable configuration.
//! Validation is explicit: callers run [`LoadBalanceConfig::validate`]
//! before constructing runtime components.

pub mod de;
pub mod group;
pub mod pool;

pub use group::{
    EmptyPoolAction, HashConfig, HysteresisConfig, LoadBalanceConfig, OnEmptyKey, Strategy, TopN,
};
pub use pool::ConnectionPoolConfig;

use thiserror::Error;

/// Validation failures for dispatch-core configuration blocks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("primary_outbounds is required and must be non-empty")]
    MissingPrimaryOutbounds,

    #[error("top_n.primary must be > 0")]
    InvalidTopN,

    #[error("hash configuration required for consistent_hash strategy")]
    MissingHashConfig,

    #[error("hash.virtual_nodes must be > 0")]
    InvalidVirtualNodes,

    #[error("hysteresis.primary_failures must be > 0")]
    InvalidPrimaryFailures,

    #[error("duplicate outbound tag: {0}")]
    DuplicateTag(String),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),
}
