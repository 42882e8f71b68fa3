//! Dispatch error kinds with stable discriminators.
//!
//! The classification rule: anything the user experiences as "my
//! connection attempt failed" is surfaced here; anything that only makes a
//! candidate pool momentarily smaller is logged and swallowed at the site
//! that observed it.

use crate::types::Network;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Dispatch was called before the first candidate snapshot exists.
    /// Retry after startup completes.
    #[error("dispatch not initialized")]
    NotInitialized,

    /// Both tiers are empty and `empty_pool_action` is `error`.
    #[error("no healthy candidates available in any tier")]
    NoHealthyCandidates,

    /// The active tier has candidates, but none support the requested
    /// network.
    #[error("no candidates support network {0}")]
    NoCandidatesForNetwork(Network),

    /// Reserved for the router inbound.
    #[error("routing loop detected")]
    RoutingLoop,

    /// A configured tag no longer resolves in the registry.
    #[error("outbound not found: {0}")]
    OutboundNotFound(String),

    /// The selected outbound's dial failure, verbatim.
    #[error("upstream dial failed: {0}")]
    UpstreamDialFailed(#[source] io::Error),
}

impl From<DispatchError> for io::Error {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::NotInitialized => io::Error::new(io::ErrorKind::NotConnected, e),
            DispatchError::NoHealthyCandidates | DispatchError::OutboundNotFound(_) => {
                io::Error::new(io::ErrorKind::NotFound, e)
            }
            DispatchError::NoCandidatesForNetwork(_) => {
                io::Error::new(io::ErrorKind::Unsupported, e)
            }
            DispatchError::RoutingLoop => io::Error::other(e),
            DispatchError::UpstreamDialFailed(inner) => inner,
        }
    }
}
