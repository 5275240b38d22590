//! CIDR membership sets, one per address family.
//!
//! Networks are kept sorted by prefix length (most specific first) so a
//! lookup can stop at the first containing network. The sets are built
//! once at load time and only read afterwards.

use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::{IpNetworkError, Ipv4Network, Ipv6Network};

#[derive(Default)]
pub struct PrefixSet {
    v4: Vec<Ipv4Network>,
    v6: Vec<Ipv6Network>,
}

impl PrefixSet {
    pub fn add(&mut self, ip: IpAddr, cidr: Option<u8>) -> Result<(), IpNetworkError> {
        match ip {
            IpAddr::V4(addr) => {
                let net = Ipv4Network::new(addr, cidr.unwrap_or(32))?;
                insert_sorted(&mut self.v4, net, |n| n.prefix());
            }
            IpAddr::V6(addr) => {
                let net = Ipv6Network::new(addr, cidr.unwrap_or(128))?;
                insert_sorted(&mut self.v6, net, |n| n.prefix());
            }
        }
        Ok(())
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(addr) => self.contains_v4(addr),
            IpAddr::V6(addr) => {
                // A v4-mapped address belongs to the v4 rules.
                if let Some(mapped) = addr.to_ipv4_mapped() {
                    self.contains_v4(mapped)
                } else {
                    self.v6.iter().any(|net| net.contains(addr))
                }
            }
        }
    }

    fn contains_v4(&self, addr: Ipv4Addr) -> bool {
        self.v4.iter().any(|net| net.contains(addr))
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }
}

fn insert_sorted<T, F: Fn(&T) -> u8>(nets: &mut Vec<T>, net: T, prefix: F) {
    let pos = nets
        .iter()
        .position(|n| prefix(n) < prefix(&net))
        .unwrap_or(nets.len());
    nets.insert(pos, net);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_host_and_network() {
        let mut set = PrefixSet::default();
        set.add("10.0.0.0".parse().unwrap(), Some(8)).unwrap();
        set.add("192.0.2.1".parse().unwrap(), None).unwrap();

        assert!(set.contains("10.255.1.2".parse().unwrap()));
        assert!(set.contains("192.0.2.1".parse().unwrap()));
        assert!(!set.contains("192.0.2.2".parse().unwrap()));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn invalid_prefix_rejected() {
        let mut set = PrefixSet::default();
        assert!(set.add("10.0.0.0".parse().unwrap(), Some(33)).is_err());
        assert!(set.is_empty());
    }

    #[test]
    fn v4_mapped_v6_hits_v4_rules() {
        let mut set = PrefixSet::default();
        set.add("10.0.0.0".parse().unwrap(), Some(8)).unwrap();
        assert!(set.contains("::ffff:10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn v6_network_membership() {
        let mut set = PrefixSet::default();
        set.add("2001:db8::".parse().unwrap(), Some(32)).unwrap();
        assert!(set.contains("2001:db8:1::1".parse().unwrap()));
        assert!(!set.contains("2001:db9::1".parse().unwrap()));
    }
}
