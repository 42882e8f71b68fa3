//! Traffic dispatch core of a userspace proxy.
//!
//! Decides, per inbound connection, which upstream outbound transports it:
//! a latency-tiered load-balancing group ([`balance::LoadBalance`]) over
//! health-probed members, with random or consistent-hash selection
//! ([`ring::HashRing`] keyed by [`hashkey::build_hash_key`]). Protocol
//! codecs and routing live outside this crate, behind the [`adapter`]
//! traits.

pub mod adapter;
pub mod balance;
pub mod context;
pub mod error;
pub mod etld;
pub mod hashkey;
pub mod history;
pub mod interrupt;
pub mod pause;
pub mod ring;
pub mod types;
pub mod urltest;

pub use adapter::{Outbound, OutboundGroup, OutboundRegistry};
pub use context::InboundContext;
pub use error::DispatchError;
pub use types::{Endpoint, Host, Network};
