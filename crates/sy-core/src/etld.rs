//! Effective TLD+1 extraction for session-affinity hash keys.

use std::net::IpAddr;

/// Placeholder returned for IP addresses and empty input.
pub const NOT_A_DOMAIN: &str = "-";

/// Extract the eTLD+1 (effective top-level domain plus one label) from a
/// raw host string using the Public Suffix List.
///
/// The input is normalized first: surrounding whitespace trimmed,
/// lowercased, one trailing dot stripped, then any port suffix stripped.
/// IP addresses and empty input yield `"-"`. When the PSL cannot derive an
/// eTLD+1 (unknown TLD, single label like `localhost`, or the whole name
/// being itself a public suffix), the normalized string is returned as-is.
///
/// `"Example.COM:443."` -> `"example.com"`,
/// `"a.b.example.co.uk"` -> `"example.co.uk"`,
/// `"192.168.1.1"` -> `"-"`.
pub fn extract_etld_plus_one(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return NOT_A_DOMAIN.to_string();
    }

    let mut domain = trimmed.to_ascii_lowercase();

    // Trailing dot goes first: a port may itself carry one (":443.").
    if domain.ends_with('.') {
        domain.pop();
    }

    let domain = strip_port(&domain);

    if domain.is_empty() {
        return NOT_A_DOMAIN.to_string();
    }
    if domain.parse::<IpAddr>().is_ok() {
        return NOT_A_DOMAIN.to_string();
    }

    match psl::domain_str(domain) {
        Some(etld_plus_one) => etld_plus_one.to_string(),
        None => domain.to_string(),
    }
}

/// Remove a port suffix from a `host:port` string, leaving bare IPv6
/// literals untouched.
fn strip_port(host_port: &str) -> &str {
    // Bracketed form: "[::1]:8080" or "[::1]" -> inner address.
    if let Some(rest) = host_port.strip_prefix('[') {
        return match rest.find(']') {
            Some(close) => &rest[..close],
            None => host_port,
        };
    }

    // More than one colon means an IPv6 literal, not host:port.
    if host_port.bytes().filter(|b| *b == b':').count() > 1 {
        return host_port;
    }

    match host_port.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        Some(_) => host_port,
        None => host_port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_suffixes() {
        assert_eq!(extract_etld_plus_one("example.co.uk"), "example.co.uk");
        assert_eq!(extract_etld_plus_one("www.example.co.uk"), "example.co.uk");
        assert_eq!(
            extract_etld_plus_one("a.b.example.co.uk"),
            "example.co.uk"
        );
        assert_eq!(extract_etld_plus_one("a.b.example.com"), "example.com");
    }

    #[test]
    fn normalization_case_port_trailing_dot() {
        assert_eq!(extract_etld_plus_one("EXAMPLE.COM:443."), "example.com");
        assert_eq!(extract_etld_plus_one("Example.COM"), "example.com");
        assert_eq!(extract_etld_plus_one("example.com."), "example.com");
        assert_eq!(extract_etld_plus_one("  example.com  "), "example.com");
        assert_eq!(extract_etld_plus_one("www.example.com:8443"), "example.com");
    }

    #[test]
    fn ip_addresses_are_not_domains() {
        assert_eq!(extract_etld_plus_one("192.168.1.1"), "-");
        assert_eq!(extract_etld_plus_one("192.168.1.1:443"), "-");
        assert_eq!(extract_etld_plus_one("::1"), "-");
        assert_eq!(extract_etld_plus_one("[2001:db8::1]:443"), "-");
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(extract_etld_plus_one(""), "-");
        assert_eq!(extract_etld_plus_one("   "), "-");
        assert_eq!(extract_etld_plus_one("."), "-");
    }

    #[test]
    fn psl_failure_falls_back_to_normalized() {
        assert_eq!(extract_etld_plus_one("localhost"), "localhost");
        // The whole name is a private-registry public suffix; eTLD+1 cannot
        // be derived, so the normalized name comes back unchanged.
        assert_eq!(
            extract_etld_plus_one("s3.us-west-2.amazonaws.com"),
            "s3.us-west-2.amazonaws.com"
        );
    }

    #[test]
    fn extraction_is_idempotent() {
        for input in [
            "a.b.example.co.uk",
            "www.example.com:443",
            "localhost",
            "EXAMPLE.ORG.",
            "s3.us-west-2.amazonaws.com",
        ] {
            let once = extract_etld_plus_one(input);
            assert_ne!(once, "-");
            assert_eq!(extract_etld_plus_one(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn strip_port_edge_cases() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com:"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("example.com:http"), "example.com:http");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
        assert_eq!(strip_port("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(strip_port("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(strip_port("[broken"), "[broken");
    }
}
