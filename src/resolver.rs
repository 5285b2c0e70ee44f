use std::fmt;

use crate::error::TunnelError;
use crate::protocol::{Address, Command, HandshakeRequest};

pub const DEFAULT_RESERVED_PREFIX: &str = "cf.";

/// Final outbound target for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Rewrites domains that cannot be reached directly from the edge to a
/// known-good egress address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackPolicy {
    reserved_prefix: String,
    egress: String,
}

impl FallbackPolicy {
    #[must_use]
    pub fn new(reserved_prefix: impl Into<String>, egress: impl Into<String>) -> Self {
        Self {
            reserved_prefix: reserved_prefix.into(),
            egress: egress.into(),
        }
    }

    /// Returns the egress address if `domain` carries the reserved prefix.
    #[must_use]
    pub fn rewrite(&self, domain: &str) -> Option<&str> {
        let prefix = self.reserved_prefix.as_bytes();
        domain
            .as_bytes()
            .get(..prefix.len())
            .filter(|head| head.eq_ignore_ascii_case(prefix))
            .map(|_| self.egress.as_str())
    }
}

/// Turns an authenticated handshake into the address to dial.
pub fn resolve(
    request: &HandshakeRequest,
    policy: &FallbackPolicy,
) -> Result<Destination, TunnelError> {
    if request.command != Command::Connect {
        return Err(TunnelError::Unsupported(request.command));
    }

    let host = match &request.address {
        Address::Domain(domain) => policy
            .rewrite(domain)
            .map_or_else(|| domain.clone(), str::to_string),
        other => other.to_string(),
    };

    Ok(Destination {
        host,
        port: request.port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const EGRESS: &str = "162.159.192.1";

    fn policy() -> FallbackPolicy {
        FallbackPolicy::new(DEFAULT_RESERVED_PREFIX, EGRESS)
    }

    fn request(command: Command, address: Address, port: u16) -> HandshakeRequest {
        HandshakeRequest {
            version: 0,
            credential: [0; 16],
            command,
            port,
            address,
            payload: Bytes::new(),
        }
    }

    #[test]
    fn reserved_prefix_uses_fallback_egress() {
        let req = request(Command::Connect, Address::Domain("cf.example".into()), 443);
        let destination = resolve(&req, &policy()).unwrap();
        assert_eq!(
            destination,
            Destination {
                host: EGRESS.to_string(),
                port: 443
            }
        );
    }

    #[test]
    fn prefix_match_ignores_ascii_case() {
        let req = request(Command::Connect, Address::Domain("CF.Example".into()), 80);
        assert_eq!(resolve(&req, &policy()).unwrap().host, EGRESS);
    }

    #[test]
    fn other_domains_resolve_to_themselves() {
        for domain in ["example.com", "cf", "notcf.example", "abc"] {
            let req = request(Command::Connect, Address::Domain(domain.into()), 80);
            assert_eq!(resolve(&req, &policy()).unwrap().host, domain);
        }
    }

    #[test]
    fn ip_addresses_are_never_rewritten() {
        let req = request(Command::Connect, Address::Ipv4(Ipv4Addr::new(10, 1, 2, 3)), 22);
        assert_eq!(resolve(&req, &policy()).unwrap().to_string(), "10.1.2.3:22");

        let req = request(Command::Connect, Address::Ipv6(Ipv6Addr::LOCALHOST), 22);
        assert_eq!(
            resolve(&req, &policy()).unwrap().to_string(),
            "[0:0:0:0:0:0:0:1]:22"
        );
    }

    #[test]
    fn udp_associate_is_unsupported() {
        let req = request(
            Command::UdpAssociate,
            Address::Domain("cf.example".into()),
            53,
        );
        assert!(matches!(
            resolve(&req, &policy()),
            Err(TunnelError::Unsupported(Command::UdpAssociate))
        ));
    }
}
