use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::net::IpAddr;

/// Parses the original client IP from an X-Forwarded-For header.
/// Format: "client, proxy1, proxy2, ..." - returns the leftmost entry.
#[must_use]
pub fn parse_original_client_ip(xff_header: &str) -> Option<String> {
    xff_header
        .split(',')
        .next()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Peers allowed to open connections. Built once at startup.
#[derive(Debug, Clone, Default)]
pub struct PeerAllowlist {
    networks: Option<Vec<IpNet>>,
}

impl PeerAllowlist {
    /// No entries configured means every peer is allowed.
    pub fn parse(entries: Option<&[String]>) -> Result<Self> {
        let Some(entries) = entries else {
            return Ok(Self::default());
        };

        let networks = entries
            .iter()
            .map(|entry| {
                let entry = entry.trim();
                entry
                    .parse::<IpAddr>()
                    .map(IpNet::from)
                    .or_else(|_| entry.parse::<IpNet>())
                    .map_err(|_| {
                        anyhow!("Invalid IP address or CIDR in allowed_proxy_ips: {entry}")
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            networks: Some(networks),
        })
    }

    #[must_use]
    pub fn allows(&self, peer: IpAddr) -> bool {
        self.networks
            .as_ref()
            .is_none_or(|networks| networks.iter().any(|net| net.contains(&peer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn leftmost_forwarded_ip_is_client() {
        assert_eq!(
            parse_original_client_ip("203.0.113.7, 10.0.0.1, 10.0.0.2"),
            Some("203.0.113.7".to_string())
        );
        assert_eq!(parse_original_client_ip("  "), None);
        assert_eq!(parse_original_client_ip(""), None);
    }

    #[test]
    fn unset_allowlist_allows_everyone() {
        let allowlist = PeerAllowlist::parse(None).unwrap();
        assert!(allowlist.allows("198.51.100.1".parse().unwrap()));
    }

    #[test]
    fn matches_single_addresses_and_networks() {
        let entries = list(&["10.0.0.0/8", "192.168.1.1", "::1"]);
        let allowlist = PeerAllowlist::parse(Some(&entries)).unwrap();

        assert!(allowlist.allows("10.20.30.40".parse().unwrap()));
        assert!(allowlist.allows("192.168.1.1".parse().unwrap()));
        assert!(allowlist.allows("::1".parse().unwrap()));
        assert!(!allowlist.allows("192.168.1.2".parse().unwrap()));
        assert!(!allowlist.allows("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn empty_allowlist_allows_nobody() {
        let allowlist = PeerAllowlist::parse(Some(&[])).unwrap();
        assert!(!allowlist.allows("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn malformed_entry_is_an_error() {
        let entries = list(&["10.0.0.0/8", "not-an-ip"]);
        let err = PeerAllowlist::parse(Some(&entries)).unwrap_err();
        assert!(err.to_string().contains("not-an-ip"));
    }
}
