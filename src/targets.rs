//! Target enumeration: CIDR parsing, exclusion matching and the lazy,
//! inclusive address sequence walked by each subnet pass.
use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net};
use tracing::warn;

use crate::error::TargetError;

/// Parse one subnet entry. A bare IPv4 address is treated as a /32.
pub fn parse_subnet(input: &str) -> Result<Ipv4Net, TargetError> {
    let s = input.trim();
    let net = if s.contains('/') {
        s.parse::<IpNet>().map_err(|e| TargetError::Malformed {
            input: input.to_string(),
            reason: e.to_string(),
        })?
    } else {
        match s.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => IpNet::V4(Ipv4Net::new(v4, 32).map_err(|e| {
                TargetError::Malformed { input: input.to_string(), reason: e.to_string() }
            })?),
            Ok(IpAddr::V6(_)) => return Err(TargetError::Ipv6Unsupported(input.to_string())),
            Err(e) => {
                return Err(TargetError::Malformed {
                    input: input.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    };
    match net {
        IpNet::V4(n4) => Ok(n4.trunc()),
        IpNet::V6(_) => Err(TargetError::Ipv6Unsupported(input.to_string())),
    }
}

/// Parse a subnet list, keeping input order. Bad entries are returned
/// separately so the remaining subnets can still be scanned.
pub fn parse_subnets<S: AsRef<str>>(inputs: &[S]) -> (Vec<Ipv4Net>, Vec<TargetError>) {
    let mut nets = Vec::new();
    let mut errors = Vec::new();
    for input in inputs {
        match parse_subnet(input.as_ref()) {
            Ok(n) => nets.push(n),
            Err(e) => errors.push(e),
        }
    }
    (nets, errors)
}

/// Number of addresses from network through broadcast, inclusive.
pub fn address_count(net: &Ipv4Net) -> u64 {
    1u64 << (32 - u32::from(net.prefix_len()))
}

/// Lazy, restartable walk over every address of an IPv4 network in numeric order,
/// network and broadcast addresses included.
#[derive(Debug, Clone)]
pub struct SubnetEnumerator {
    next: Option<u32>,
    end: u32,
}

impl SubnetEnumerator {
    pub fn new(net: Ipv4Net) -> Self {
        Self {
            next: Some(u32::from(net.network())),
            end: u32::from(net.broadcast()),
        }
    }
}

impl Iterator for SubnetEnumerator {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Ipv4Addr> {
        let cur = self.next?;
        self.next = if cur < self.end { Some(cur + 1) } else { None };
        Some(Ipv4Addr::from(cur))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.next {
            Some(cur) => {
                let left = (self.end - cur) as usize + 1;
                (left, Some(left))
            }
            None => (0, Some(0)),
        }
    }
}

/// Addresses that are enumerated but never handed to a worker.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    nets: Vec<Ipv4Net>,
}

impl Exclusions {
    /// Build from CIDR/IP strings. Malformed entries are logged and ignored.
    pub fn parse<S: AsRef<str>>(inputs: &[S]) -> Self {
        let (nets, errors) = parse_subnets(inputs);
        for e in errors {
            warn!(error = %e, "ignoring exclusion entry");
        }
        Self { nets }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.nets.iter().any(|n| n.contains(&ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_matches_prefix() {
        for (cidr, expected) in [
            ("10.0.0.0/30", 4u64),
            ("10.0.0.0/24", 256),
            ("10.0.0.7/32", 1),
            ("172.16.0.0/22", 1024),
        ] {
            let net = parse_subnet(cidr).unwrap();
            assert_eq!(address_count(&net), expected, "{cidr}");
            assert_eq!(SubnetEnumerator::new(net).count() as u64, expected, "{cidr}");
        }
        assert_eq!(address_count(&parse_subnet("0.0.0.0/0").unwrap()), 1u64 << 32);
    }

    #[test]
    fn walk_is_inclusive_and_ordered() {
        let net = parse_subnet("192.168.1.0/30").unwrap();
        let ips: Vec<Ipv4Addr> = SubnetEnumerator::new(net).collect();
        assert_eq!(
            ips,
            vec![
                Ipv4Addr::new(192, 168, 1, 0),
                Ipv4Addr::new(192, 168, 1, 1),
                Ipv4Addr::new(192, 168, 1, 2),
                Ipv4Addr::new(192, 168, 1, 3),
            ]
        );
    }

    #[test]
    fn host_bits_are_truncated() {
        let net = parse_subnet("10.1.2.77/24").unwrap();
        assert_eq!(net.to_string(), "10.1.2.0/24");
    }

    #[test]
    fn last_address_does_not_overflow() {
        let net = parse_subnet("255.255.255.254/31").unwrap();
        let ips: Vec<Ipv4Addr> = SubnetEnumerator::new(net).collect();
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[1], Ipv4Addr::BROADCAST);
    }

    #[test]
    fn bad_entries_do_not_stop_good_ones() {
        let (nets, errors) = parse_subnets(&["10.0.0.0/30", "10.0.0.0/33", "nonsense", "fe80::/64"]);
        assert_eq!(nets.len(), 1);
        assert_eq!(errors.len(), 3);
        assert!(matches!(errors[2], TargetError::Ipv6Unsupported(_)));
    }

    #[test]
    fn exclusions_match_members_only() {
        let ex = Exclusions::parse(&["10.0.0.1/32", "192.168.5.0/24", "garbage"]);
        assert!(ex.contains(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(ex.contains(Ipv4Addr::new(192, 168, 5, 200)));
        assert!(!ex.contains(Ipv4Addr::new(10, 0, 0, 2)));
    }
}
