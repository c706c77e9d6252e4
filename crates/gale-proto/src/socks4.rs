//! SOCKS4 and the 4a domain extension, CONNECT only.
//!
//! ```text
//! request                                        response
//! +----+-----+----------+--------+--------+----+ +----+----+------+------+
//! |VER | CMD | DST.PORT | DST.IP | USERID |NULL| | VN | REP| PORT |  IP  |
//! +----+-----+----------+--------+--------+----+ +----+----+------+------+
//! | 1  |  1  |    2     |   4    |variable| 1  | | 1  | 1  |  2   |  4   |
//! +----+-----+----------+--------+--------+----+ +----+----+------+------+
//! ```
//!
//! A 4a request carries an IP whose first three octets are `0.0.0`
//! and appends a null-terminated domain after the userid.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};
use gale_core::{buffer::StreamBuffer, types::TargetAddr};
use num_enum::{FromPrimitive, IntoPrimitive};
use snafu::{ResultExt, ensure};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
	BadTextSnafu, NotSupportedSnafu, ProtoError, Refusal, RejectedSnafu, UnknownTagSnafu,
	VersionMismatchSnafu, truncated,
};

pub const VER: u8 = 4;

// Userid the client half sends; SOCKS4 has no other credential slot.
const USER_ID: &[u8] = b"gale";

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Cmd {
	Connect = 1,
	Bind    = 2,
	#[num_enum(catch_all)]
	Other(u8),
}

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Rep {
	Granted     = 0x5a,
	Rejected    = 0x5b,
	Unreachable = 0x5c,
	AuthFailed  = 0x5d,
	#[num_enum(catch_all)]
	Other(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
	pub cmd:     Cmd,
	pub addr:    TargetAddr,
	pub user_id: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestCodec;

impl Decoder for RequestCodec {
	type Error = ProtoError;
	type Item = Request;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < 9 {
			return Ok(None);
		}
		let Some(uid_len) = src[8..].iter().position(|&b| b == 0) else {
			return Ok(None);
		};

		let octets = [src[4], src[5], src[6], src[7]];
		let is_4a = octets[..3] == [0, 0, 0];
		let after_uid = 8 + uid_len + 1;
		let mut domain_len = 0;
		if is_4a {
			let Some(len) = src[after_uid..].iter().position(|&b| b == 0) else {
				return Ok(None);
			};
			domain_len = len;
		}

		let ver = src.get_u8();
		ensure!(ver == VER, VersionMismatchSnafu { expect: VER, current: ver });
		let cmd = Cmd::from(src.get_u8());
		ensure!(
			!matches!(cmd, Cmd::Other(_)),
			UnknownTagSnafu {
				what:  "socks4 command",
				value: u8::from(cmd),
			}
		);
		let port = src.get_u16();
		src.advance(4);
		let user_id = src.split_to(uid_len).to_vec();
		src.advance(1);
		let addr = if is_4a {
			let raw = src.split_to(domain_len);
			src.advance(1);
			let domain = std::str::from_utf8(&raw)
				.context(BadTextSnafu { what: "domain" })?
				.to_owned();
			TargetAddr::Domain(domain, port)
		} else {
			TargetAddr::IPv4(Ipv4Addr::from(octets), port)
		};
		Ok(Some(Request { cmd, addr, user_id }))
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(src)? {
			Some(item) => Ok(Some(item)),
			None if src.is_empty() => Ok(None),
			None => Err(truncated()),
		}
	}
}

impl Encoder<&Request> for RequestCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
		dst.reserve(9 + item.user_id.len());
		dst.put_u8(VER);
		dst.put_u8(item.cmd.into());
		dst.put_u16(item.addr.port());
		match &item.addr {
			TargetAddr::IPv4(ip, _) => {
				dst.put_slice(&ip.octets());
				dst.put_slice(&item.user_id);
				dst.put_u8(0);
			}
			TargetAddr::Domain(domain, _) => {
				dst.put_slice(&[0, 0, 0, 1]);
				dst.put_slice(&item.user_id);
				dst.put_u8(0);
				dst.put_slice(domain.as_bytes());
				dst.put_u8(0);
			}
			TargetAddr::IPv6(..) => {
				return NotSupportedSnafu {
					what: String::from("ipv6 over socks4"),
				}
				.fail();
			}
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Response {
	pub rep: Rep,
}

#[derive(Debug, Clone, Copy)]
pub struct ResponseCodec;

impl Decoder for ResponseCodec {
	type Error = ProtoError;
	type Item = Response;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < 8 {
			return Ok(None);
		}
		let vn = src.get_u8();
		ensure!(vn == 0, VersionMismatchSnafu { expect: 0u8, current: vn });
		let rep = Rep::from(src.get_u8());
		src.advance(6);
		Ok(Some(Response { rep }))
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(src)? {
			Some(item) => Ok(Some(item)),
			None if src.is_empty() => Ok(None),
			None => Err(truncated()),
		}
	}
}

impl Encoder<&Response> for ResponseCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: &Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
		dst.reserve(8);
		dst.put_u8(0);
		dst.put_u8(item.rep.into());
		dst.put_u16(0);
		dst.put_slice(&Ipv4Addr::UNSPECIFIED.octets());
		Ok(())
	}
}

pub struct Socks4Parser;

impl Socks4Parser {
	pub async fn accept<R, W>(&self, rd: &mut StreamBuffer<R>, _wr: &mut W) -> Result<TargetAddr, ProtoError>
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		let request = rd.pull(&mut RequestCodec).await?;
		ensure!(
			request.cmd == Cmd::Connect,
			NotSupportedSnafu {
				what: format!("socks4 command {:?}", request.cmd),
			}
		);
		Ok(request.addr)
	}

	pub async fn finish<W>(&self, wr: &mut W) -> Result<(), ProtoError>
	where
		W: AsyncWrite + Unpin,
	{
		self.respond(wr, Rep::Granted).await
	}

	pub async fn refuse<W>(&self, wr: &mut W, refusal: Refusal) -> Result<(), ProtoError>
	where
		W: AsyncWrite + Unpin,
	{
		let rep = match refusal {
			Refusal::HostUnreachable => Rep::Unreachable,
			_ => Rep::Rejected,
		};
		self.respond(wr, rep).await
	}

	async fn respond<W>(&self, wr: &mut W, rep: Rep) -> Result<(), ProtoError>
	where
		W: AsyncWrite + Unpin,
	{
		let mut buf = BytesMut::new();
		ResponseCodec.encode(&Response { rep }, &mut buf)?;
		wr.write_all(&buf).await?;
		wr.flush().await?;
		Ok(())
	}

	pub async fn connect<R, W>(
		&self,
		rd: &mut StreamBuffer<R>,
		wr: &mut W,
		target: &TargetAddr,
	) -> Result<(), ProtoError>
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		let mut buf = BytesMut::new();
		RequestCodec.encode(
			&Request {
				cmd:     Cmd::Connect,
				addr:    target.clone(),
				user_id: USER_ID.to_vec(),
			},
			&mut buf,
		)?;
		wr.write_all(&buf).await?;
		wr.flush().await?;

		let response = rd.pull(&mut ResponseCodec).await?;
		ensure!(
			response.rep == Rep::Granted,
			RejectedSnafu {
				detail: format!("socks4 reply {:?}", response.rep),
			}
		);
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn plain_request() -> eyre::Result<()> {
		let wire: &[u8] = &[
			0x04, 0x01, 0x00, 0x50, 1, 2, 3, 4, // CONNECT 1.2.3.4:80
			b'f', b'r', b'e', b'd', 0x00,
		];
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let parser = Socks4Parser;
		let target = parser.accept(&mut rd, &mut wr).await?;
		assert_eq!(target, TargetAddr::from_host_port("1.2.3.4", 80));

		parser.finish(&mut wr).await?;
		assert_eq!(&wr[..], &[0x00, 0x5a, 0x00, 0x00, 0, 0, 0, 0]);
		Ok(())
	}

	#[tokio::test]
	async fn socks4a_domain() -> eyre::Result<()> {
		// Any low octet marks a 4a request, including the 0.0.0.0
		// sentinel.
		for low_octet in [1u8, 0] {
			let mut wire = vec![0x04, 0x01, 0x01, 0xbb, 0, 0, 0, low_octet];
			wire.extend_from_slice(b"fred\0");
			wire.extend_from_slice(b"example.com\0");
			let mut rd = StreamBuffer::new(&wire[..]);
			let mut wr = Vec::new();
			let target = Socks4Parser.accept(&mut rd, &mut wr).await?;
			assert_eq!(target, TargetAddr::from_host_port("example.com", 443));
		}
		Ok(())
	}

	#[tokio::test]
	async fn bind_rejected() {
		let wire: &[u8] = &[0x04, 0x02, 0x00, 0x50, 1, 2, 3, 4, 0x00];
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let err = Socks4Parser.accept(&mut rd, &mut wr).await.unwrap_err();
		assert!(matches!(err, ProtoError::NotSupported { .. }));
	}

	#[tokio::test]
	async fn request_round_trip() -> eyre::Result<()> {
		for addr in [
			TargetAddr::from_host_port("10.1.2.3", 8080),
			TargetAddr::from_host_port("internal.example", 70),
		] {
			let request = Request {
				cmd:     Cmd::Connect,
				addr:    addr.clone(),
				user_id: USER_ID.to_vec(),
			};
			let mut buf = BytesMut::new();
			RequestCodec.encode(&request, &mut buf)?;
			let back = RequestCodec.decode(&mut buf)?.unwrap();
			assert!(buf.is_empty());
			assert_eq!(back.addr, addr);
		}
		Ok(())
	}

	#[tokio::test]
	async fn client_half() -> eyre::Result<()> {
		let wire: &[u8] = &[0x00, 0x5a, 0x00, 0x00, 0, 0, 0, 0];
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let target = TargetAddr::from_host_port("1.2.3.4", 80);
		Socks4Parser.connect(&mut rd, &mut wr, &target).await?;
		assert_eq!(&wr[..8], &[0x04, 0x01, 0x00, 0x50, 1, 2, 3, 4]);
		assert_eq!(&wr[8..], b"gale\0");

		let wire: &[u8] = &[0x00, 0x5b, 0x00, 0x00, 0, 0, 0, 0];
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let err = Socks4Parser.connect(&mut rd, &mut wr, &target).await.unwrap_err();
		assert!(matches!(err, ProtoError::Rejected { .. }));
		Ok(())
	}
}
