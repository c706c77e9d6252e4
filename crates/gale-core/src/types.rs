use std::{
	fmt,
	net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use serde::{Deserialize, Serialize};

/// Destination extracted from a client handshake.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetAddr {
	Domain(String, u16),
	IPv4(Ipv4Addr, u16),
	IPv6(Ipv6Addr, u16),
}

impl TargetAddr {
	/// Builds a `TargetAddr` from a host string, trying an IPv4 parse,
	/// then IPv6, then falling back to a domain name.
	pub fn from_host_port(host: &str, port: u16) -> Self {
		if let Ok(ip) = host.parse::<Ipv4Addr>() {
			return TargetAddr::IPv4(ip, port);
		}
		if let Ok(ip) = host.parse::<Ipv6Addr>() {
			return TargetAddr::IPv6(ip, port);
		}
		TargetAddr::Domain(host.to_owned(), port)
	}

	pub fn host(&self) -> String {
		match self {
			TargetAddr::Domain(domain, _) => domain.clone(),
			TargetAddr::IPv4(ip, _) => ip.to_string(),
			TargetAddr::IPv6(ip, _) => ip.to_string(),
		}
	}

	pub fn port(&self) -> u16 {
		match self {
			TargetAddr::Domain(_, port) | TargetAddr::IPv4(_, port) | TargetAddr::IPv6(_, port) => *port,
		}
	}

	/// The literal IP, when the address is not a domain name.
	pub fn ip(&self) -> Option<IpAddr> {
		match self {
			TargetAddr::Domain(..) => None,
			TargetAddr::IPv4(ip, _) => Some(IpAddr::V4(*ip)),
			TargetAddr::IPv6(ip, _) => Some(IpAddr::V6(*ip)),
		}
	}

	pub fn socket_addr(&self) -> Option<SocketAddr> {
		match self {
			TargetAddr::Domain(..) => None,
			TargetAddr::IPv4(ip, port) => Some(SocketAddr::from((*ip, *port))),
			TargetAddr::IPv6(ip, port) => Some(SocketAddr::from((*ip, *port))),
		}
	}
}

impl From<SocketAddr> for TargetAddr {
	fn from(addr: SocketAddr) -> Self {
		match addr {
			SocketAddr::V4(v4) => TargetAddr::IPv4(*v4.ip(), v4.port()),
			SocketAddr::V6(v6) => TargetAddr::IPv6(*v6.ip(), v6.port()),
		}
	}
}

impl fmt::Display for TargetAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
			TargetAddr::IPv4(ip, port) => write!(f, "{ip}:{port}"),
			TargetAddr::IPv6(ip, port) => write!(f, "[{ip}]:{port}"),
		}
	}
}

#[cfg(test)]
mod test {
	use super::TargetAddr;

	#[test]
	fn host_port_parse_order() {
		assert_eq!(
			TargetAddr::from_host_port("1.2.3.4", 80),
			TargetAddr::IPv4("1.2.3.4".parse().unwrap(), 80)
		);
		assert_eq!(
			TargetAddr::from_host_port("::1", 80),
			TargetAddr::IPv6("::1".parse().unwrap(), 80)
		);
		assert_eq!(
			TargetAddr::from_host_port("example.com", 443),
			TargetAddr::Domain(String::from("example.com"), 443)
		);
	}

	#[test]
	fn display() {
		assert_eq!(TargetAddr::from_host_port("1.2.3.4", 80).to_string(), "1.2.3.4:80");
		assert_eq!(TargetAddr::from_host_port("::1", 80).to_string(), "[::1]:80");
		assert_eq!(
			TargetAddr::from_host_port("example.com", 443).to_string(),
			"example.com:443"
		);
	}
}
