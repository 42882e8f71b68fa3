//! Outbound abstraction and registry.
//!
//! Every upstream, whether a leaf dialer or another group, is an
//! [`Outbound`] addressable by its string tag. The dispatch core treats
//! them uniformly through this trait and resolves tags via the
//! [`OutboundRegistry`].

use crate::context::InboundContext;
use crate::types::{Endpoint, Network};
use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;

/// Marker for types usable as a boxed bidirectional byte stream.
pub trait AsyncReadWrite: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}

impl<T> AsyncReadWrite for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}

impl std::fmt::Debug for dyn AsyncReadWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AsyncReadWrite")
    }
}

/// Unified stream type returned by every dial path.
pub type IoStream = Box<dyn AsyncReadWrite>;

/// Datagram session opened by a UDP-capable outbound.
#[async_trait]
pub trait PacketConn: Send {
    async fn send_to(&mut self, buf: &[u8], destination: &Endpoint) -> io::Result<usize>;
    async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)>;
}

impl std::fmt::Debug for dyn PacketConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PacketConn")
    }
}

pub type BoxPacketConn = Box<dyn PacketConn>;

/// An upstream transport addressable by tag.
#[async_trait]
pub trait Outbound: Send + Sync {
    fn tag(&self) -> &str;

    /// Networks this outbound can carry.
    fn network(&self) -> Vec<Network>;

    async fn dial(
        &self,
        ctx: &InboundContext,
        network: Network,
        destination: &Endpoint,
    ) -> io::Result<IoStream>;

    async fn listen_packet(
        &self,
        ctx: &InboundContext,
        destination: &Endpoint,
    ) -> io::Result<BoxPacketConn> {
        let _ = (ctx, destination);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "packet connections not supported",
        ))
    }
}

/// Group surface on top of [`Outbound`]: inspection of the current pick
/// and the configured membership.
pub trait OutboundGroup: Outbound {
    /// Representative current selection, or empty before the first
    /// snapshot.
    fn now_tag(&self) -> String;

    /// Union of configured member tags, in configuration order.
    fn all_tags(&self) -> Vec<String>;
}

/// Tag-addressed collection of outbounds.
#[derive(Default)]
pub struct OutboundRegistry {
    entries: DashMap<String, Arc<dyn Outbound>>,
}

impl OutboundRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, outbound: Arc<dyn Outbound>) {
        self.entries.insert(outbound.tag().to_string(), outbound);
    }

    pub fn lookup(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        self.entries.get(tag).map(|e| e.value().clone())
    }

    pub fn remove(&self, tag: &str) {
        self.entries.remove(tag);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for OutboundRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundRegistry")
            .field("len", &self.entries.len())
            .finish()
    }
}
