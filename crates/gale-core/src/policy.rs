//! Destination gating: blacklist, private-address filter and country
//! block, applied to every extracted target before the outbound dial.

use std::{
	collections::HashSet,
	net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use snafu::Snafu;

use crate::types::TargetAddr;

#[derive(Debug, Snafu)]
pub enum PolicyError {
	#[snafu(display("destination {host} is blacklisted"))]
	Blacklisted { host: String },
	#[snafu(display("destination {host} is not globally routable"))]
	NotGlobal { host: String },
	#[snafu(display("country {country} is blocked"))]
	BlockedCountry { country: String },
}

/// Read-only after startup; one instance is shared by every route.
#[derive(Debug, Default)]
pub struct DestPolicy {
	pub blacklist:          HashSet<IpAddr>,
	pub block_internal_ips: bool,
	pub blocked_countries:  HashSet<String>,
}

impl DestPolicy {
	pub fn check(&self, target: &TargetAddr) -> Result<(), PolicyError> {
		// Domain targets resolve later; only literal IPs are gated.
		if let Some(ip) = target.ip() {
			if self.blacklist.contains(&ip) {
				return BlacklistedSnafu { host: target.host() }.fail();
			}
			if self.block_internal_ips && !is_global(ip) {
				return NotGlobalSnafu { host: target.host() }.fail();
			}
		}
		Ok(())
	}

	/// Country gate for ws/wss inbounds fronted by a CDN that stamps
	/// the origin country onto the upgrade request.
	pub fn check_country(&self, country: &str) -> Result<(), PolicyError> {
		if self.blocked_countries.contains(country) {
			return BlockedCountrySnafu { country }.fail();
		}
		Ok(())
	}
}

fn is_global_v4(ip: Ipv4Addr) -> bool {
	if ip.is_unspecified() || ip.is_private() || ip.is_loopback() || ip.is_link_local() {
		return false;
	}
	if ip.is_broadcast() || ip.is_documentation() {
		return false;
	}
	let octets = ip.octets();
	// Shared address space 100.64/10, benchmarking 198.18/15,
	// reserved 240/4.
	if octets[0] == 100 && (octets[1] & 0xc0) == 64 {
		return false;
	}
	if octets[0] == 198 && (octets[1] & 0xfe) == 18 {
		return false;
	}
	if octets[0] & 0xf0 == 240 {
		return false;
	}
	true
}

fn is_global_v6(ip: Ipv6Addr) -> bool {
	if let Some(v4) = ip.to_ipv4_mapped() {
		return is_global_v4(v4);
	}
	if ip.is_unspecified() || ip.is_loopback() {
		return false;
	}
	let segments = ip.segments();
	// Unique-local fc00::/7, link-local fe80::/10, documentation
	// 2001:db8::/32.
	if (segments[0] & 0xfe00) == 0xfc00 {
		return false;
	}
	if (segments[0] & 0xffc0) == 0xfe80 {
		return false;
	}
	if segments[0] == 0x2001 && segments[1] == 0xdb8 {
		return false;
	}
	true
}

pub fn is_global(ip: IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => is_global_v4(v4),
		IpAddr::V6(v6) => is_global_v6(v6),
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn ip(s: &str) -> IpAddr {
		s.parse().unwrap()
	}

	#[test]
	fn global_ranges() {
		assert!(!is_global(ip("127.0.0.1")));
		assert!(!is_global(ip("192.168.20.168")));
		assert!(!is_global(ip("10.1.2.3")));
		assert!(!is_global(ip("100.64.0.1")));
		assert!(!is_global(ip("0.0.0.0")));
		assert!(is_global(ip("211.13.20.168")));
		assert!(is_global(ip("1.1.1.1")));
		assert!(!is_global(ip("::1")));
		assert!(!is_global(ip("fe80::1")));
		assert!(!is_global(ip("fd00::1")));
		assert!(is_global(ip("2606:4700::1111")));
	}

	#[test]
	fn blacklist_and_internal() {
		let mut policy = DestPolicy::default();
		policy.blacklist.insert(ip("10.0.0.1"));
		policy.block_internal_ips = true;

		let blocked = TargetAddr::from_host_port("10.0.0.1", 22);
		assert!(matches!(policy.check(&blocked), Err(PolicyError::Blacklisted { .. })));

		let private = TargetAddr::from_host_port("192.168.1.1", 80);
		assert!(matches!(policy.check(&private), Err(PolicyError::NotGlobal { .. })));

		// Domain names pass, localhost included; resolution happens at
		// dial time.
		let domain = TargetAddr::from_host_port("example.com", 443);
		assert!(policy.check(&domain).is_ok());
		let local = TargetAddr::from_host_port("localhost", 443);
		assert!(policy.check(&local).is_ok());

		let public = TargetAddr::from_host_port("1.1.1.1", 443);
		assert!(policy.check(&public).is_ok());
	}

	#[test]
	fn country_block() {
		let mut policy = DestPolicy::default();
		policy.blocked_countries.insert(String::from("XX"));
		assert!(policy.check_country("XX").is_err());
		assert!(policy.check_country("SE").is_ok());
	}
}
