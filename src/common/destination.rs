//! Destination - the intended target of an intercepted connection attempt
//!
//! The routing decision ONLY depends on Destination, never on the channel.

use std::fmt;
use std::net::IpAddr;

use super::Address;

/// Where the monitored client wanted to connect.
///
/// `resolved` is `None` when the acceptor only knows the hostname; the
/// hostname is kept as-is so resolution happens lazily in the connect step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub resolved: Option<IpAddr>,
    pub port: u16,
}

impl Destination {
    /// Destination known only by name
    pub fn unresolved(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            resolved: None,
            port,
        }
    }

    /// Destination with an already resolved address
    pub fn resolved(host: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            host: host.into(),
            resolved: Some(ip),
            port,
        }
    }

    /// Destination observed as a bare IP (host is the textual IP)
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self::resolved(ip.to_string(), ip, port)
    }

    pub fn is_unresolved(&self) -> bool {
        self.resolved.is_none()
    }

    /// The address a direct relay would use: hostname if unresolved,
    /// otherwise the resolved socket address.
    pub fn target(&self) -> Address {
        match self.resolved {
            Some(ip) => Address::ip_port(ip, self.port),
            None => Address::domain(self.host.clone(), self.port),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resolved {
            Some(ip) if ip.to_string() != self.host => {
                write!(f, "{}/{}:{}", self.host, ip, self.port)
            }
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_keeps_hostname_when_unresolved() {
        let dest = Destination::unresolved("example.com", 443);
        assert!(dest.is_unresolved());
        assert_eq!(dest.target(), Address::domain("example.com", 443));
    }

    #[test]
    fn test_target_uses_resolved_ip() {
        let ip: IpAddr = "93.184.216.34".parse().unwrap();
        let dest = Destination::resolved("example.com", ip, 80);
        assert_eq!(dest.target(), Address::ip_port(ip, 80));
        assert_eq!(dest.to_string(), "example.com/93.184.216.34:80");
    }
}
