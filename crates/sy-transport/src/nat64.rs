//! NAT64 destination rewriting (RFC 6052).
//!
//! Wraps a base dialer and embeds IPv4 destinations into an IPv6 /96
//! prefix so they traverse IPv6-only networks. IPv6 and domain
//! destinations pass through unchanged.

use crate::dialer::{DialError, Dialer, IoStream};
use async_trait::async_trait;
use ipnet::Ipv6Net;
use std::net::IpAddr;
use sy_core::adapter::BoxPacketConn;
use sy_core::types::{Endpoint, Host, Network};

pub struct Nat64Dialer<D> {
    inner: D,
    prefix: Ipv6Net,
}

impl<D> Nat64Dialer<D> {
    /// Wrap `inner` with a NAT64 prefix, which must be a /96.
    pub fn new(inner: D, prefix: Ipv6Net) -> Result<Self, DialError> {
        if prefix.prefix_len() != 96 {
            return Err(DialError::Other(format!(
                "nat64 prefix must be /96, got /{}",
                prefix.prefix_len()
            )));
        }
        Ok(Self { inner, prefix })
    }

    fn translate(&self, destination: &Endpoint) -> Endpoint {
        match destination.host.as_ip() {
            Some(IpAddr::V4(v4)) => {
                // IPv4 bytes land in octets 12..16 of the /96 prefix.
                let mut octets = self.prefix.addr().octets();
                octets[12..16].copy_from_slice(&v4.octets());
                Endpoint::new(Host::ip(IpAddr::V6(octets.into())), destination.port)
            }
            _ => destination.clone(),
        }
    }
}

#[async_trait]
impl<D: Dialer> Dialer for Nat64Dialer<D> {
    async fn connect(
        &self,
        network: Network,
        destination: &Endpoint,
    ) -> Result<IoStream, DialError> {
        self.inner.connect(network, &self.translate(destination)).await
    }

    async fn listen_packet(&self, destination: &Endpoint) -> Result<BoxPacketConn, DialError> {
        self.inner.listen_packet(&self.translate(destination)).await
    }
}
