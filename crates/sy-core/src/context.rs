//! Per-connection metadata consumed by dispatch decisions.

use crate::types::{Endpoint, Network};
use std::net::SocketAddr;

/// Read-only record describing one inbound connection. Populated by the
/// inbound/router layers; the dispatch core only reads it.
#[derive(Debug, Clone, Default)]
pub struct InboundContext {
    pub source: Option<SocketAddr>,
    /// Destination as requested: an IP or an unresolved FQDN, plus port.
    pub destination: Option<Endpoint>,
    pub network: Option<Network>,
    /// Domain sniffed from the payload (TLS SNI, HTTP Host), if any.
    pub domain: String,
    /// Tag of the inbound that accepted the connection.
    pub inbound: String,
    /// Tag of the rule-set that matched this connection, if any.
    pub matched_rule_set: String,
}

impl InboundContext {
    /// The domain this connection is for: an FQDN destination wins over a
    /// sniffed domain.
    pub fn chosen_domain(&self) -> Option<&str> {
        if let Some(dest) = &self.destination {
            if let Some(fqdn) = dest.host.as_domain() {
                return Some(fqdn);
            }
        }
        if self.domain.is_empty() {
            None
        } else {
            Some(&self.domain)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Host;

    #[test]
    fn chosen_domain_prefers_fqdn_destination() {
        let ctx = InboundContext {
            destination: Some(Endpoint::new(Host::domain("a.example.com"), 443)),
            domain: "sniffed.example.org".into(),
            ..Default::default()
        };
        assert_eq!(ctx.chosen_domain(), Some("a.example.com"));
    }

    #[test]
    fn chosen_domain_falls_back_to_sniffed() {
        let ctx = InboundContext {
            destination: Some(Endpoint::new(Host::parse("10.0.0.1"), 443)),
            domain: "sniffed.example.org".into(),
            ..Default::default()
        };
        assert_eq!(ctx.chosen_domain(), Some("sniffed.example.org"));

        let empty = InboundContext::default();
        assert_eq!(empty.chosen_domain(), None);
    }
}
