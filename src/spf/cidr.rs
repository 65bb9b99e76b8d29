use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub fn ip4_in_network(ip: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    match prefix {
        0 => true,
        1..=32 => {
            let mask = u32::MAX << (32 - prefix);
            u32::from(ip) & mask == u32::from(network) & mask
        }
        _ => false,
    }
}

pub fn ip6_in_network(ip: Ipv6Addr, network: Ipv6Addr, prefix: u8) -> bool {
    match prefix {
        0 => true,
        1..=128 => {
            let mask = u128::MAX << (128 - prefix);
            u128::from(ip) & mask == u128::from(network) & mask
        }
        _ => false,
    }
}

/// Family-aware match; an address never matches a network of the other family.
pub fn ip_in_network(ip: IpAddr, network: IpAddr, cidr4: u8, cidr6: u8) -> bool {
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => ip4_in_network(ip, net, cidr4),
        (IpAddr::V6(ip), IpAddr::V6(net)) => ip6_in_network(ip, net, cidr6),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip4_subnet_boundaries() {
        let net: Ipv4Addr = "10.20.0.0".parse().unwrap();
        assert!(ip4_in_network("10.20.99.1".parse().unwrap(), net, 16));
        assert!(!ip4_in_network("10.21.0.0".parse().unwrap(), net, 16));
        assert!(ip4_in_network("192.0.2.1".parse().unwrap(), net, 0));
        assert!(!ip4_in_network(net, net, 33));
    }

    #[test]
    fn ip6_subnet_boundaries() {
        let net: Ipv6Addr = "2001:db8::".parse().unwrap();
        assert!(ip6_in_network("2001:db8:0:0:ffff::1".parse().unwrap(), net, 64));
        assert!(!ip6_in_network("2001:db8:0:1::1".parse().unwrap(), net, 64));
        assert!(ip6_in_network("2001:db8::1".parse().unwrap(), "2001:db8::1".parse().unwrap(), 128));
    }

    #[test]
    fn mixed_families_never_match() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let v6: IpAddr = "::ffff:192.0.2.1".parse().unwrap();
        assert!(!ip_in_network(v4, v6, 0, 0));
    }
}
