//! Session-affinity hash key composition.
//!
//! A hash key is a `|`-joined sequence of values extracted from
//! [`InboundContext`] fields, each named by a [`KeyPart`]. Missing values
//! use the `-` placeholder so the key shape stays stable regardless of
//! which metadata a connection carries. The builder is deterministic and
//! side-effect-free.

use crate::context::InboundContext;
use crate::etld::extract_etld_plus_one;

const PLACEHOLDER: &str = "-";

/// One component of a hash key, parsed from its configuration name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPart {
    SrcIp,
    DstIp,
    SrcPort,
    DstPort,
    Network,
    Domain,
    InboundTag,
    MatchedRuleset,
    EtldPlusOne,
    /// Matched rule-set tag when present, otherwise the eTLD+1; a single
    /// value, never two.
    MatchedRulesetOrEtld,
    /// Embeds the configured salt as an ordinary joined part.
    Salt,
    /// Unrecognized identifier; contributes the placeholder.
    Unknown,
}

impl KeyPart {
    pub fn parse(name: &str) -> Self {
        match name {
            "src_ip" => Self::SrcIp,
            "dst_ip" => Self::DstIp,
            "src_port" => Self::SrcPort,
            "dst_port" => Self::DstPort,
            "network" => Self::Network,
            "domain" => Self::Domain,
            "inbound_tag" => Self::InboundTag,
            "matched_ruleset" => Self::MatchedRuleset,
            "etld_plus_one" => Self::EtldPlusOne,
            "matched_ruleset_or_etld" => Self::MatchedRulesetOrEtld,
            "salt" => Self::Salt,
            _ => Self::Unknown,
        }
    }

    pub fn parse_all(names: &[String]) -> Vec<KeyPart> {
        names.iter().map(|n| KeyPart::parse(n)).collect()
    }
}

/// Compose the hash key for one connection.
///
/// An empty `parts` list yields the empty string. A non-empty `salt` is
/// prepended before the first part with no separator, unless
/// [`KeyPart::Salt`] appears in `parts`, in which case the salt is joined
/// as a part instead (two deployed dialects; both are kept).
pub fn build_hash_key(metadata: &InboundContext, parts: &[KeyPart], salt: &str) -> String {
    if parts.is_empty() {
        return String::new();
    }

    let mut values: Vec<String> = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            KeyPart::SrcIp => values.push(match metadata.source {
                Some(addr) => addr.ip().to_string(),
                None => PLACEHOLDER.to_string(),
            }),
            KeyPart::DstIp => values.push(
                metadata
                    .destination
                    .as_ref()
                    .and_then(|d| d.host.as_ip())
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| PLACEHOLDER.to_string()),
            ),
            KeyPart::SrcPort => values.push(match metadata.source {
                Some(addr) => addr.port().to_string(),
                None => PLACEHOLDER.to_string(),
            }),
            KeyPart::DstPort => values.push(match &metadata.destination {
                Some(dest) => dest.port.to_string(),
                None => PLACEHOLDER.to_string(),
            }),
            KeyPart::Network => values.push(match metadata.network {
                Some(network) => network.to_string(),
                None => PLACEHOLDER.to_string(),
            }),
            KeyPart::Domain => values.push(
                metadata
                    .chosen_domain()
                    .unwrap_or(PLACEHOLDER)
                    .to_string(),
            ),
            KeyPart::InboundTag => values.push(non_empty_or_placeholder(&metadata.inbound)),
            KeyPart::MatchedRuleset => {
                values.push(non_empty_or_placeholder(&metadata.matched_rule_set))
            }
            KeyPart::EtldPlusOne => {
                values.push(extract_etld_plus_one(metadata.chosen_domain().unwrap_or("")))
            }
            KeyPart::MatchedRulesetOrEtld => {
                if metadata.matched_rule_set.is_empty() {
                    values.push(extract_etld_plus_one(metadata.chosen_domain().unwrap_or("")));
                } else {
                    values.push(metadata.matched_rule_set.clone());
                }
            }
            KeyPart::Salt => {
                if !salt.is_empty() {
                    values.push(salt.to_string());
                }
            }
            KeyPart::Unknown => values.push(PLACEHOLDER.to_string()),
        }
    }

    let key = values.join("|");
    if salt.is_empty() || parts.contains(&KeyPart::Salt) {
        key
    } else {
        format!("{salt}{key}")
    }
}

fn non_empty_or_placeholder(value: &str) -> String {
    if value.is_empty() {
        PLACEHOLDER.to_string()
    } else {
        value.to_string()
    }
}
