//! SOCKS5-style address encoding, shared by SOCKS5, Trojan and both
//! Shadowsocks dialects.
//!
//! ```text
//! +------+----------+------+
//! | ATYP | DST.ADDR | PORT |
//! +------+----------+------+
//! |  1   | variable |  2   |
//! +------+----------+------+
//! ```
//!
//! ATYP 1 = IPv4 (4 bytes), 3 = domain (length-prefixed), 4 = IPv6
//! (16 bytes); the port is big-endian.

use std::{
	net::{Ipv4Addr, Ipv6Addr},
	str,
};

use bytes::{Buf, BufMut};
use gale_core::types::TargetAddr;
use num_enum::{FromPrimitive, IntoPrimitive};
use snafu::{ResultExt, ensure};
use tokio_util::codec::{Decoder, Encoder};

use crate::{BadTextSnafu, DomainTooLongSnafu, ProtoError, UnknownTagSnafu, truncated};

#[derive(Debug, Clone, Copy)]
pub struct AddrCodec;

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Atyp {
	IPv4   = 1,
	Domain = 3,
	IPv6   = 4,
	#[num_enum(catch_all)]
	Other(u8),
}

/// Wire length of the encoded address starting at `buf[0]`, or `None`
/// when not enough bytes have arrived to cover it.
pub(crate) fn wire_len(buf: &[u8]) -> Result<Option<usize>, ProtoError> {
	let Some(&atyp) = buf.first() else {
		return Ok(None);
	};
	let needed = match Atyp::from(atyp) {
		Atyp::IPv4 => 1 + 4 + 2,
		Atyp::IPv6 => 1 + 16 + 2,
		Atyp::Domain => {
			let Some(&len) = buf.get(1) else {
				return Ok(None);
			};
			1 + 1 + len as usize + 2
		}
		Atyp::Other(value) => {
			return UnknownTagSnafu { what: "address type", value }.fail();
		}
	};
	Ok((buf.len() >= needed).then_some(needed))
}

impl Decoder for AddrCodec {
	type Error = ProtoError;
	type Item = TargetAddr;

	fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if wire_len(&src[..])?.is_none() {
			return Ok(None);
		}

		let atyp = Atyp::from(src.get_u8());
		match atyp {
			Atyp::IPv4 => {
				let mut octets = [0u8; 4];
				src.copy_to_slice(&mut octets);
				let port = src.get_u16();
				Ok(Some(TargetAddr::IPv4(Ipv4Addr::from(octets), port)))
			}
			Atyp::IPv6 => {
				let mut octets = [0u8; 16];
				src.copy_to_slice(&mut octets);
				let port = src.get_u16();
				Ok(Some(TargetAddr::IPv6(Ipv6Addr::from(octets), port)))
			}
			Atyp::Domain => {
				let len = src.get_u8() as usize;
				let domain = str::from_utf8(&src[..len])
					.context(BadTextSnafu { what: "domain" })?
					.to_owned();
				src.advance(len);
				let port = src.get_u16();
				Ok(Some(TargetAddr::Domain(domain, port)))
			}
			Atyp::Other(_) => unreachable!("rejected by wire_len"),
		}
	}

	fn decode_eof(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(src)? {
			Some(item) => Ok(Some(item)),
			None if src.is_empty() => Ok(None),
			None => Err(truncated()),
		}
	}
}

impl Encoder<&TargetAddr> for AddrCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: &TargetAddr, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
		match item {
			TargetAddr::IPv4(ip, port) => {
				dst.reserve(1 + 4 + 2);
				dst.put_u8(Atyp::IPv4.into());
				dst.put_slice(&ip.octets());
				dst.put_u16(*port);
			}
			TargetAddr::IPv6(ip, port) => {
				dst.reserve(1 + 16 + 2);
				dst.put_u8(Atyp::IPv6.into());
				dst.put_slice(&ip.octets());
				dst.put_u16(*port);
			}
			TargetAddr::Domain(domain, port) => {
				ensure!(domain.len() <= u8::MAX as usize, DomainTooLongSnafu { domain });
				dst.reserve(1 + 1 + domain.len() + 2);
				dst.put_u8(Atyp::Domain.into());
				dst.put_u8(domain.len() as u8);
				dst.put_slice(domain.as_bytes());
				dst.put_u16(*port);
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use bytes::BytesMut;

	use super::*;

	fn all_variants() -> Vec<TargetAddr> {
		vec![
			TargetAddr::from_host_port("127.0.0.1", 80),
			TargetAddr::from_host_port("::1", 8388),
			TargetAddr::from_host_port("www.example.com", 443),
		]
	}

	#[test]
	fn round_trip_with_exact_length() -> eyre::Result<()> {
		for addr in all_variants() {
			let mut buf = BytesMut::new();
			AddrCodec.encode(&addr, &mut buf)?;
			let expect_len = match &addr {
				TargetAddr::IPv4(..) => 1 + 4 + 2,
				TargetAddr::IPv6(..) => 1 + 16 + 2,
				TargetAddr::Domain(domain, _) => 1 + 1 + domain.len() + 2,
			};
			assert_eq!(buf.len(), expect_len);
			let back = AddrCodec.decode(&mut buf)?.unwrap();
			assert!(buf.is_empty());
			assert_eq!(back, addr);
		}
		Ok(())
	}

	/// Simulates streaming arrival: the first half of an encoded
	/// address must decode to nothing, the recombined buffer must
	/// decode fully.
	#[test]
	fn partial_then_complete() -> eyre::Result<()> {
		for addr in all_variants() {
			let mut full = BytesMut::new();
			AddrCodec.encode(&addr, &mut full)?;
			let second = full.split_off(full.len() / 2);

			assert!(AddrCodec.decode(&mut full)?.is_none());
			assert!(AddrCodec.decode_eof(&mut full).is_err());

			full.unsplit(second);
			assert_eq!(AddrCodec.decode(&mut full)?.unwrap(), addr);
		}
		Ok(())
	}

	#[test]
	fn unknown_atyp() {
		let mut buf = BytesMut::from(&[0x02u8, 0, 0, 0, 0, 0, 0][..]);
		assert!(matches!(
			AddrCodec.decode(&mut buf),
			Err(ProtoError::UnknownTag { value: 2, .. })
		));
	}

	#[test]
	fn known_bytes() -> eyre::Result<()> {
		let mut buf = BytesMut::new();
		AddrCodec.encode(&TargetAddr::from_host_port("1.2.3.4", 80), &mut buf)?;
		assert_eq!(&buf[..], &[0x01, 1, 2, 3, 4, 0x00, 0x50]);
		Ok(())
	}
}
