//! Fundamental value types: `Host`, `Endpoint`, `Network`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Host representation that can be either a domain name or an IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ip(IpAddr),
    Name(Box<str>),
}

impl Host {
    pub fn domain(domain: impl Into<String>) -> Self {
        Self::Name(domain.into().into_boxed_str())
    }

    pub fn ip(ip: IpAddr) -> Self {
        Self::Ip(ip)
    }

    /// Parse a host from a string (IP literal first, domain otherwise).
    pub fn parse(s: &str) -> Self {
        match s.parse::<IpAddr>() {
            Ok(ip) => Self::Ip(ip),
            Err(_) => Self::Name(s.into()),
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Host::Name(_))
    }

    pub fn is_ip(&self) -> bool {
        matches!(self, Host::Ip(_))
    }

    pub fn as_domain(&self) -> Option<&str> {
        match self {
            Host::Name(d) => Some(d),
            Host::Ip(_) => None,
        }
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            Host::Name(_) => None,
            Host::Ip(ip) => Some(*ip),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Name(d) => write!(f, "{}", d),
            Host::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        Self::ip(ip)
    }
}

impl From<&str> for Host {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for Host {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

/// Dial destination: host plus port. The host may be an unresolved FQDN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: Host,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<Host>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            host: Host::ip(addr.ip()),
            port: addr.port(),
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.host.as_ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if matches!(self.host.as_ip(), Some(IpAddr::V6(_))) {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

/// Network protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
