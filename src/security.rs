//! The IP filter: allow/deny lists of CIDR ranges consulted before any peer
//! is connected or accepted. Deny entries win over allow entries; an empty
//! allow list permits every address that is not denied.

use std::net::IpAddr;

use crate::error::*;

/// An address range in CIDR notation (a bare address is a /32 or /128).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parses `"10.0.0.0/8"`, `"2001:db8::/32"`, or a bare address.
    pub fn parse(s: &str) -> Result<Self> {
        let (addr, prefix_len) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix_len: u8 = prefix.parse().map_err(|_| {
                    Error::InvalidIpFilter("invalid CIDR prefix")
                })?;
                (addr, Some(prefix_len))
            }
            None => (s, None),
        };
        let network: IpAddr = addr
            .parse()
            .map_err(|_| Error::InvalidIpFilter("invalid CIDR address"))?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = prefix_len.unwrap_or(max_prefix);
        if prefix_len > max_prefix {
            return Err(Error::InvalidIpFilter("CIDR prefix out of range"));
        }
        Ok(Self {
            network,
            prefix_len,
        })
    }

    /// Whether the address falls inside this range. Mixed address families
    /// never match.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(network), IpAddr::V4(addr)) => {
                let mask = prefix_mask_v4(self.prefix_len);
                u32::from(network) & mask == u32::from(*addr) & mask
            }
            (IpAddr::V6(network), IpAddr::V6(addr)) => {
                let mask = prefix_mask_v6(self.prefix_len);
                u128::from(network) & mask == u128::from(*addr) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_v4(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        len => u32::MAX << (32 - len as u32),
    }
}

fn prefix_mask_v6(prefix_len: u8) -> u128 {
    match prefix_len {
        0 => 0,
        len => u128::MAX << (128 - len as u32),
    }
}

/// The engine wide peer address filter, loaded at startup from the
/// configured allow and deny lists.
#[derive(Clone, Debug, Default)]
pub(crate) struct IpFilter {
    allow: Vec<CidrRange>,
    deny: Vec<CidrRange>,
}

impl IpFilter {
    /// Builds the filter from configured range strings. Invalid entries are
    /// rejected so a typo doesn't silently open the filter up.
    pub fn new(allow: &[String], deny: &[String]) -> Result<Self> {
        Ok(Self {
            allow: allow
                .iter()
                .map(|s| CidrRange::parse(s))
                .collect::<Result<_>>()?,
            deny: deny
                .iter()
                .map(|s| CidrRange::parse(s))
                .collect::<Result<_>>()?,
        })
    }

    /// Whether a peer at this address may be connected or accepted.
    pub fn is_allowed(&self, addr: &IpAddr) -> bool {
        if self.deny.iter().any(|range| range.contains(addr)) {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        self.allow.iter().any(|range| range.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_cidr_parse_and_contains() {
        let range = CidrRange::parse("10.0.0.0/8").unwrap();
        assert!(range.contains(&ip("10.1.2.3")));
        assert!(!range.contains(&ip("11.0.0.1")));

        // a bare address is an exact match
        let single = CidrRange::parse("192.168.1.1").unwrap();
        assert!(single.contains(&ip("192.168.1.1")));
        assert!(!single.contains(&ip("192.168.1.2")));

        // the zero prefix matches everything in its family
        let all = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(all.contains(&ip("255.255.255.255")));
        assert!(!all.contains(&ip("::1")));
    }

    #[test]
    fn test_cidr_v6() {
        let range = CidrRange::parse("2001:db8::/32").unwrap();
        assert!(range.contains(&ip("2001:db8::1")));
        assert!(!range.contains(&ip("2001:db9::1")));
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        assert!(CidrRange::parse("10.0.0.0/33").is_err());
        assert!(CidrRange::parse("not-an-ip").is_err());
        assert!(CidrRange::parse("10.0.0.0/x").is_err());
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let filter = IpFilter::new(
            &["10.0.0.0/8".into()],
            &["10.5.0.0/16".into()],
        )
        .unwrap();
        assert!(filter.is_allowed(&ip("10.1.0.1")));
        assert!(!filter.is_allowed(&ip("10.5.0.1")));
        // not in the allow list at all
        assert!(!filter.is_allowed(&ip("192.168.0.1")));
    }

    #[test]
    fn test_empty_filter_allows_everything() {
        let filter = IpFilter::default();
        assert!(filter.is_allowed(&ip("1.2.3.4")));
        assert!(filter.is_allowed(&ip("::1")));
    }
}
