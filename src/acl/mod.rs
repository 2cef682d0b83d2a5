//! Source-address access control.
//!
//! An [`Allowlist`] is an ordered set of CIDR prefixes built once at startup
//! and read-only afterwards. A source IP is permitted iff it falls inside at
//! least one prefix; an empty rule list denies everything.

use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

/// Result alias for allowlist construction.
pub type AclResult<T> = Result<T, AclError>;

/// Errors raised while building an allowlist.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AclError {
    /// The entry is neither a valid CIDR nor a valid IP address.
    #[error("invalid allowlist entry {0:?}")]
    InvalidRule(String),
}

/// Parse a single allowlist entry.
///
/// A bare IP is promoted to a host prefix (`/32` for IPv4, `/128` for IPv6).
pub fn parse_rule(entry: &str) -> AclResult<IpNet> {
    let trimmed = entry.trim();

    if trimmed.contains('/') {
        return trimmed
            .parse::<IpNet>()
            .map_err(|_| AclError::InvalidRule(entry.to_string()));
    }

    trimmed
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| AclError::InvalidRule(entry.to_string()))
}

/// CIDR-based allowlist. Fail-closed: no rules means no access.
#[derive(Debug, Clone)]
pub struct Allowlist {
    rules: Vec<IpNet>,
}

impl Allowlist {
    /// Build an allowlist from CIDR strings and bare IP addresses.
    pub fn new(entries: &[String]) -> AclResult<Self> {
        let mut rules = Vec::with_capacity(entries.len());
        for entry in entries {
            rules.push(parse_rule(entry)?);
        }
        Ok(Self { rules })
    }

    /// Whether the source IP matches at least one rule.
    #[must_use]
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        self.rules.iter().any(|rule| rule.contains(&ip))
    }

    /// Number of configured rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the rule list is empty (deny-all).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist(entries: &[&str]) -> Allowlist {
        let entries: Vec<String> = entries.iter().map(|s| s.to_string()).collect();
        Allowlist::new(&entries).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_cidr_match() {
        let list = allowlist(&["10.0.0.0/8", "192.168.1.0/24"]);

        assert!(list.is_allowed(ip("10.1.2.3")));
        assert!(list.is_allowed(ip("192.168.1.254")));
        assert!(!list.is_allowed(ip("192.168.2.1")));
        assert!(!list.is_allowed(ip("172.16.0.1")));
    }

    #[test]
    fn test_bare_ip_is_host_prefix() {
        let list = allowlist(&["10.0.0.1"]);

        assert!(list.is_allowed(ip("10.0.0.1")));
        assert!(!list.is_allowed(ip("10.0.0.2")));
    }

    #[test]
    fn test_ipv6() {
        let list = allowlist(&["fd00::/8", "::1"]);

        assert!(list.is_allowed(ip("fd12:3456::1")));
        assert!(list.is_allowed(ip("::1")));
        assert!(!list.is_allowed(ip("2001:db8::1")));
    }

    #[test]
    fn test_empty_list_denies_everything() {
        let list = allowlist(&[]);

        assert!(list.is_empty());
        assert!(!list.is_allowed(ip("127.0.0.1")));
        assert!(!list.is_allowed(ip("::1")));
    }

    #[test]
    fn test_match_all_prefix() {
        let list = allowlist(&["0.0.0.0/0"]);

        assert!(list.is_allowed(ip("1.2.3.4")));
        assert!(list.is_allowed(ip("255.255.255.255")));
        // An IPv4 wildcard does not admit IPv6 sources.
        assert!(!list.is_allowed(ip("::1")));
    }

    #[test]
    fn test_invalid_entries() {
        assert_eq!(
            Allowlist::new(&["not-an-ip".to_string()]).unwrap_err(),
            AclError::InvalidRule("not-an-ip".to_string())
        );
        assert!(Allowlist::new(&["10.0.0.0/40".to_string()]).is_err());
        assert!(Allowlist::new(&["300.0.0.1".to_string()]).is_err());
    }

    #[test]
    fn test_entries_are_trimmed() {
        let list = allowlist(&[" 127.0.0.1/32 "]);
        assert!(list.is_allowed(ip("127.0.0.1")));
    }
}
