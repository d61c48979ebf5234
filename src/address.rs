use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub fn from(s: &str) -> std::io::Result<Self> {
        let mut dots = 0;
        let mut possible_ipv4 = true;
        let mut possible_ipv6 = true;
        let mut possible_hostname = true;
        for b in s.as_bytes().iter() {
            let c = *b;
            if c == b':' {
                possible_ipv4 = false;
                possible_hostname = false;
                break;
            } else if c == b'.' {
                possible_ipv6 = false;
                dots += 1;
                if dots > 3 {
                    // can only be a hostname.
                    break;
                }
            } else if c.is_ascii_hexdigit() && !c.is_ascii_digit() {
                possible_ipv4 = false;
            } else if !c.is_ascii_digit() {
                possible_ipv4 = false;
                possible_ipv6 = false;
                break;
            }
        }

        if possible_ipv4 && dots == 3 {
            if let Ok(addr) = s.parse::<Ipv4Addr>() {
                return Ok(Address::Ipv4(addr));
            }
        }

        if possible_ipv6 {
            if let Ok(addr) = s.parse::<Ipv6Addr>() {
                return Ok(Address::Ipv6(addr));
            }
        }

        if possible_hostname {
            if s.is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "empty address",
                ));
            }
            return Ok(Address::Hostname(s.to_string()));
        }

        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to parse address: {s}"),
        ))
    }

}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(addr) => addr.fmt(f),
            Address::Ipv6(addr) => addr.fmt(f),
            Address::Hostname(hostname) => hostname.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NetLocation {
    address: Address,
    port: u16,
}

impl NetLocation {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn from_ip_addr(ip: IpAddr, port: u16) -> Self {
        let address = match ip {
            IpAddr::V4(addr) => Address::Ipv4(addr),
            IpAddr::V6(addr) => Address::Ipv6(addr),
        };
        Self { address, port }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the socket address directly when the address is an IP literal,
    /// without hitting the resolver.
    pub fn to_socket_addr_nonblocking(&self) -> Option<SocketAddr> {
        match self.address {
            Address::Ipv4(addr) => Some(SocketAddr::new(IpAddr::V4(addr), self.port)),
            Address::Ipv6(addr) => Some(SocketAddr::new(IpAddr::V6(addr), self.port)),
            Address::Hostname(_) => None,
        }
    }
}

impl std::fmt::Display for NetLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            Address::Ipv6(ref addr) => write!(f, "[{}]:{}", addr, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_from_ipv4() {
        assert_eq!(
            Address::from("1.1.1.1").unwrap(),
            Address::Ipv4(Ipv4Addr::new(1, 1, 1, 1))
        );
    }

    #[test]
    fn test_address_from_ipv6() {
        assert_eq!(
            Address::from("2606:4700::1111").unwrap(),
            Address::Ipv6("2606:4700::1111".parse().unwrap())
        );
    }

    #[test]
    fn test_address_from_hostname() {
        assert_eq!(
            Address::from("example.com").unwrap(),
            Address::Hostname("example.com".to_string())
        );
    }

    #[test]
    fn test_address_rejects_empty() {
        assert!(Address::from("").is_err());
    }

    #[test]
    fn test_net_location_display() {
        let loc = NetLocation::new(Address::Hostname("example.com".to_string()), 80);
        assert_eq!(loc.to_string(), "example.com:80");

        let loc = NetLocation::new(Address::Ipv6("::1".parse().unwrap()), 443);
        assert_eq!(loc.to_string(), "[::1]:443");
    }

    #[test]
    fn test_to_socket_addr_nonblocking() {
        let loc = NetLocation::new(Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1)), 8000);
        assert_eq!(
            loc.to_socket_addr_nonblocking(),
            Some("127.0.0.1:8000".parse().unwrap())
        );

        let loc = NetLocation::new(Address::Hostname("example.com".to_string()), 80);
        assert!(loc.to_socket_addr_nonblocking().is_none());
    }
}
