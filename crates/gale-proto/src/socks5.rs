//! SOCKS5 (RFC 1928) with optional username/password authentication
//! (RFC 1929), server and client halves. Only CONNECT is supported.
//!
//! ```text
//! greeting                       method choice
//! +----+----------+----------+  +----+--------+
//! |VER | NMETHODS | METHODS  |  |VER | METHOD |
//! +----+----------+----------+  +----+--------+
//! request / reply
//! +----+---------+-------+------+----------+----------+
//! |VER | CMD/REP |  RSV  | ATYP | DST.ADDR | DST.PORT |
//! +----+---------+-------+------+----------+----------+
//! ```

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};
use gale_core::{buffer::StreamBuffer, types::TargetAddr};
use num_enum::{FromPrimitive, IntoPrimitive};
use snafu::ensure;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::{
	AuthFailedSnafu, MalformedSnafu, NotSupportedSnafu, ProtoError, Refusal, RejectedSnafu,
	VersionMismatchSnafu,
	addr::{AddrCodec, wire_len},
	truncated,
};

pub const VER: u8 = 5;
const AUTH_VER: u8 = 1;

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum AuthMethod {
	NoAuth       = 0,
	Gssapi       = 1,
	UserAuth     = 2,
	NoAcceptable = 0xff,
	#[num_enum(catch_all)]
	Other(u8) = 3,
}

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Cmd {
	Connect   = 1,
	Bind      = 2,
	Associate = 3,
	#[num_enum(catch_all)]
	Other(u8),
}

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Rep {
	Succeeded          = 0,
	GeneralFailure     = 1,
	NotAllowed         = 2,
	NetworkUnreachable = 3,
	HostUnreachable    = 4,
	ConnectionRefused  = 5,
	TtlExpired         = 6,
	CmdNotSupported    = 7,
	AtypNotSupported   = 8,
	#[num_enum(catch_all)]
	Other(u8),
}

impl From<Refusal> for Rep {
	fn from(refusal: Refusal) -> Self {
		match refusal {
			Refusal::NotAllowed => Rep::NotAllowed,
			Refusal::HostUnreachable => Rep::HostUnreachable,
			Refusal::ConnectionRefused => Rep::ConnectionRefused,
			Refusal::General => Rep::GeneralFailure,
		}
	}
}

//-----------------------------------------------------------------------------
// Wire structures
//-----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Greeting {
	pub methods: Vec<AuthMethod>,
}

#[derive(Debug, Clone, Copy)]
pub struct GreetingCodec;

impl Decoder for GreetingCodec {
	type Error = ProtoError;
	type Item = Greeting;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < 2 {
			return Ok(None);
		}
		let nmethods = src[1] as usize;
		if src.len() < 2 + nmethods {
			return Ok(None);
		}
		let ver = src.get_u8();
		ensure!(ver == VER, VersionMismatchSnafu { expect: VER, current: ver });
		src.advance(1);
		// Unknown method bytes are carried through; they simply never
		// get selected.
		let methods = src.split_to(nmethods).iter().map(|&m| AuthMethod::from(m)).collect();
		Ok(Some(Greeting { methods }))
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(src)? {
			Some(item) => Ok(Some(item)),
			None if src.is_empty() => Ok(None),
			None => Err(truncated()),
		}
	}
}

impl Encoder<&Greeting> for GreetingCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: &Greeting, dst: &mut BytesMut) -> Result<(), Self::Error> {
		dst.reserve(2 + item.methods.len());
		dst.put_u8(VER);
		dst.put_u8(item.methods.len() as u8);
		for method in &item.methods {
			dst.put_u8((*method).into());
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MethodChoice {
	pub method: AuthMethod,
}

#[derive(Debug, Clone, Copy)]
pub struct MethodChoiceCodec;

impl Decoder for MethodChoiceCodec {
	type Error = ProtoError;
	type Item = MethodChoice;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < 2 {
			return Ok(None);
		}
		let ver = src.get_u8();
		ensure!(ver == VER, VersionMismatchSnafu { expect: VER, current: ver });
		Ok(Some(MethodChoice {
			method: AuthMethod::from(src.get_u8()),
		}))
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(src)? {
			Some(item) => Ok(Some(item)),
			None if src.is_empty() => Ok(None),
			None => Err(truncated()),
		}
	}
}

impl Encoder<&MethodChoice> for MethodChoiceCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: &MethodChoice, dst: &mut BytesMut) -> Result<(), Self::Error> {
		dst.reserve(2);
		dst.put_u8(VER);
		dst.put_u8(item.method.into());
		Ok(())
	}
}

/// RFC 1929 username/password sub-negotiation request.
#[derive(Debug, Clone, PartialEq)]
pub struct UserAuth {
	pub username: String,
	pub password: String,
}

#[derive(Debug, Clone, Copy)]
pub struct UserAuthCodec;

impl Decoder for UserAuthCodec {
	type Error = ProtoError;
	type Item = UserAuth;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < 2 {
			return Ok(None);
		}
		let ulen = src[1] as usize;
		if src.len() < 2 + ulen + 1 {
			return Ok(None);
		}
		let plen = src[2 + ulen] as usize;
		if src.len() < 2 + ulen + 1 + plen {
			return Ok(None);
		}
		let ver = src.get_u8();
		ensure!(ver == AUTH_VER, VersionMismatchSnafu { expect: AUTH_VER, current: ver });
		src.advance(1);
		let username = take_string(src, ulen, "username")?;
		src.advance(1);
		let password = take_string(src, plen, "password")?;
		Ok(Some(UserAuth { username, password }))
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(src)? {
			Some(item) => Ok(Some(item)),
			None if src.is_empty() => Ok(None),
			None => Err(truncated()),
		}
	}
}

fn take_string(src: &mut BytesMut, len: usize, what: &'static str) -> Result<String, ProtoError> {
	let raw = src.split_to(len);
	String::from_utf8(raw.to_vec()).map_err(|_| {
		MalformedSnafu {
			what,
			detail: String::from("not valid utf-8"),
		}
		.build()
	})
}

impl Encoder<&UserAuth> for UserAuthCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: &UserAuth, dst: &mut BytesMut) -> Result<(), Self::Error> {
		ensure!(
			item.username.len() <= 255 && item.password.len() <= 255,
			MalformedSnafu {
				what:   "credentials",
				detail: String::from("longer than 255 bytes"),
			}
		);
		dst.reserve(3 + item.username.len() + item.password.len());
		dst.put_u8(AUTH_VER);
		dst.put_u8(item.username.len() as u8);
		dst.put_slice(item.username.as_bytes());
		dst.put_u8(item.password.len() as u8);
		dst.put_slice(item.password.as_bytes());
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UserAuthReply {
	pub status: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct UserAuthReplyCodec;

impl Decoder for UserAuthReplyCodec {
	type Error = ProtoError;
	type Item = UserAuthReply;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < 2 {
			return Ok(None);
		}
		let ver = src.get_u8();
		ensure!(ver == AUTH_VER, VersionMismatchSnafu { expect: AUTH_VER, current: ver });
		Ok(Some(UserAuthReply { status: src.get_u8() }))
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(src)? {
			Some(item) => Ok(Some(item)),
			None if src.is_empty() => Ok(None),
			None => Err(truncated()),
		}
	}
}

impl Encoder<&UserAuthReply> for UserAuthReplyCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: &UserAuthReply, dst: &mut BytesMut) -> Result<(), Self::Error> {
		dst.reserve(2);
		dst.put_u8(AUTH_VER);
		dst.put_u8(item.status);
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
	pub cmd:  Cmd,
	pub addr: TargetAddr,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectRequestCodec;

impl Decoder for ConnectRequestCodec {
	type Error = ProtoError;
	type Item = ConnectRequest;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < 3 {
			return Ok(None);
		}
		if wire_len(&src[3..])?.is_none() {
			return Ok(None);
		}
		let ver = src.get_u8();
		ensure!(ver == VER, VersionMismatchSnafu { expect: VER, current: ver });
		let cmd = Cmd::from(src.get_u8());
		let rsv = src.get_u8();
		ensure!(
			rsv == 0,
			MalformedSnafu {
				what:   "socks5 request",
				detail: format!("reserved byte is {rsv:#04x}"),
			}
		);
		match AddrCodec.decode(src)? {
			Some(addr) => Ok(Some(ConnectRequest { cmd, addr })),
			None => unreachable!("address length was checked"),
		}
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(src)? {
			Some(item) => Ok(Some(item)),
			None if src.is_empty() => Ok(None),
			None => Err(truncated()),
		}
	}
}

impl Encoder<&ConnectRequest> for ConnectRequestCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: &ConnectRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
		dst.reserve(3);
		dst.put_u8(VER);
		dst.put_u8(item.cmd.into());
		dst.put_u8(0);
		AddrCodec.encode(&item.addr, dst)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
	pub rep:  Rep,
	pub addr: TargetAddr,
}

impl Reply {
	fn unbound(rep: Rep) -> Self {
		Reply {
			rep,
			addr: TargetAddr::IPv4(Ipv4Addr::UNSPECIFIED, 0),
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct ReplyCodec;

impl Decoder for ReplyCodec {
	type Error = ProtoError;
	type Item = Reply;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < 3 {
			return Ok(None);
		}
		if wire_len(&src[3..])?.is_none() {
			return Ok(None);
		}
		let ver = src.get_u8();
		ensure!(ver == VER, VersionMismatchSnafu { expect: VER, current: ver });
		let rep = Rep::from(src.get_u8());
		src.advance(1);
		match AddrCodec.decode(src)? {
			Some(addr) => Ok(Some(Reply { rep, addr })),
			None => unreachable!("address length was checked"),
		}
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(src)? {
			Some(item) => Ok(Some(item)),
			None if src.is_empty() => Ok(None),
			None => Err(truncated()),
		}
	}
}

impl Encoder<&Reply> for ReplyCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: &Reply, dst: &mut BytesMut) -> Result<(), Self::Error> {
		dst.reserve(3);
		dst.put_u8(VER);
		dst.put_u8(item.rep.into());
		dst.put_u8(0);
		AddrCodec.encode(&item.addr, dst)
	}
}

//-----------------------------------------------------------------------------
// State machine
//-----------------------------------------------------------------------------

pub struct Socks5Parser {
	credentials: Option<(String, String)>,
}

async fn send<W, E, T>(wr: &mut W, mut codec: E, item: T) -> Result<(), ProtoError>
where
	W: AsyncWrite + Unpin,
	E: Encoder<T, Error = ProtoError>,
{
	let mut buf = BytesMut::new();
	codec.encode(item, &mut buf)?;
	wr.write_all(&buf).await?;
	wr.flush().await?;
	Ok(())
}

impl Socks5Parser {
	pub fn new(credentials: Option<(String, String)>) -> Self {
		Socks5Parser { credentials }
	}

	/// Server half up to target extraction. The caller dials the
	/// outbound next and then invokes [`finish`](Self::finish) or
	/// [`refuse`](Self::refuse).
	pub async fn accept<R, W>(&self, rd: &mut StreamBuffer<R>, wr: &mut W) -> Result<TargetAddr, ProtoError>
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		let greeting = rd.pull(&mut GreetingCodec).await?;
		match &self.credentials {
			Some((username, password)) => {
				if !greeting.methods.contains(&AuthMethod::UserAuth) {
					send(wr, MethodChoiceCodec, &MethodChoice {
						method: AuthMethod::NoAcceptable,
					})
					.await?;
					return AuthFailedSnafu.fail();
				}
				send(wr, MethodChoiceCodec, &MethodChoice {
					method: AuthMethod::UserAuth,
				})
				.await?;
				let auth = rd.pull(&mut UserAuthCodec).await?;
				if auth.username != *username || auth.password != *password {
					debug!(username = %auth.username, "credential mismatch");
					send(wr, UserAuthReplyCodec, &UserAuthReply { status: 1 }).await?;
					return AuthFailedSnafu.fail();
				}
				send(wr, UserAuthReplyCodec, &UserAuthReply { status: 0 }).await?;
			}
			None => {
				send(wr, MethodChoiceCodec, &MethodChoice {
					method: AuthMethod::NoAuth,
				})
				.await?;
			}
		}

		let request = rd.pull(&mut ConnectRequestCodec).await?;
		ensure!(
			request.cmd == Cmd::Connect,
			NotSupportedSnafu {
				what: format!("socks5 command {:?}", request.cmd),
			}
		);
		Ok(request.addr)
	}

	/// Success reply once the outbound leg is up.
	pub async fn finish<W>(&self, wr: &mut W) -> Result<(), ProtoError>
	where
		W: AsyncWrite + Unpin,
	{
		send(wr, ReplyCodec, &Reply::unbound(Rep::Succeeded)).await
	}

	/// Failure reply; the session closes afterwards.
	pub async fn refuse<W>(&self, wr: &mut W, refusal: Refusal) -> Result<(), ProtoError>
	where
		W: AsyncWrite + Unpin,
	{
		send(wr, ReplyCodec, &Reply::unbound(refusal.into())).await
	}

	/// Client half toward an upstream SOCKS5 proxy.
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
		send(wr, GreetingCodec, &Greeting {
			methods: vec![AuthMethod::NoAuth, AuthMethod::UserAuth],
		})
		.await?;
		let choice = rd.pull(&mut MethodChoiceCodec).await?;
		match (choice.method, &self.credentials) {
			(AuthMethod::NoAuth, _) => {}
			(AuthMethod::UserAuth, Some((username, password))) => {
				send(wr, UserAuthCodec, &UserAuth {
					username: username.clone(),
					password: password.clone(),
				})
				.await?;
				let reply = rd.pull(&mut UserAuthReplyCodec).await?;
				if reply.status != 0 {
					return AuthFailedSnafu.fail();
				}
			}
			(AuthMethod::UserAuth, None) => {
				return RejectedSnafu {
					detail: String::from("server requires credentials"),
				}
				.fail();
			}
			(method, _) => {
				return RejectedSnafu {
					detail: format!("no acceptable auth method, server chose {method:?}"),
				}
				.fail();
			}
		}

		send(wr, ConnectRequestCodec, &ConnectRequest {
			cmd:  Cmd::Connect,
			addr: target.clone(),
		})
		.await?;
		let reply = rd.pull(&mut ReplyCodec).await?;
		ensure!(
			reply.rep == Rep::Succeeded,
			RejectedSnafu {
				detail: format!("socks5 reply {:?}", reply.rep),
			}
		);
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	/// Scenario: no-auth greeting and a CONNECT to 1.2.3.4:80, both
	/// replies byte-checked.
	#[tokio::test]
	async fn no_auth_connect() -> eyre::Result<()> {
		let wire: &[u8] = &[
			0x05, 0x01, 0x00, // greeting, one method: no-auth
			0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50, // CONNECT 1.2.3.4:80
		];
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let parser = Socks5Parser::new(None);

		let target = parser.accept(&mut rd, &mut wr).await?;
		assert_eq!(target, TargetAddr::from_host_port("1.2.3.4", 80));
		assert_eq!(&wr[..], &[0x05, 0x00]);

		wr.clear();
		parser.finish(&mut wr).await?;
		assert_eq!(&wr[..], &[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
		Ok(())
	}

	/// Scenario: wrong password gets the RFC 1929 failure status and an
	/// `AuthFailed` error.
	#[tokio::test]
	async fn user_auth_mismatch() -> eyre::Result<()> {
		let wire: &[u8] = &[
			0x05, 0x01, 0x02, // greeting offering user-auth only
			0x01, 0x01, 0x75, 0x01, 0x71, // ver 1, user "u", pass "q"
		];
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let parser = Socks5Parser::new(Some((String::from("u"), String::from("p"))));

		let err = parser.accept(&mut rd, &mut wr).await.unwrap_err();
		assert!(matches!(err, ProtoError::AuthFailed { .. }));
		assert_eq!(&wr[..], &[0x05, 0x02, 0x01, 0x01]);
		Ok(())
	}

	#[tokio::test]
	async fn user_auth_success() -> eyre::Result<()> {
		let wire: &[u8] = &[
			0x05, 0x02, 0x00, 0x02, // greeting: no-auth + user-auth
			0x01, 0x01, 0x75, 0x01, 0x70, // user "u", pass "p"
			0x05, 0x01, 0x00, 0x03, 0x0b, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm',
			0x01, 0xbb, // CONNECT example.com:443
		];
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let parser = Socks5Parser::new(Some((String::from("u"), String::from("p"))));

		let target = parser.accept(&mut rd, &mut wr).await?;
		assert_eq!(target, TargetAddr::from_host_port("example.com", 443));
		assert_eq!(&wr[..], &[0x05, 0x02, 0x01, 0x00]);
		Ok(())
	}

	#[tokio::test]
	async fn greeting_without_user_auth_is_refused() {
		let wire: &[u8] = &[0x05, 0x01, 0x00];
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let parser = Socks5Parser::new(Some((String::from("u"), String::from("p"))));

		let err = parser.accept(&mut rd, &mut wr).await.unwrap_err();
		assert!(matches!(err, ProtoError::AuthFailed { .. }));
		assert_eq!(&wr[..], &[0x05, 0xff]);
	}

	#[tokio::test]
	async fn bind_command_rejected() {
		let wire: &[u8] = &[
			0x05, 0x01, 0x00, // greeting
			0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50, // BIND
		];
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let parser = Socks5Parser::new(None);
		let err = parser.accept(&mut rd, &mut wr).await.unwrap_err();
		assert!(matches!(err, ProtoError::NotSupported { .. }));
	}

	/// Client half against a scripted server transcript.
	#[tokio::test]
	async fn client_handshake() -> eyre::Result<()> {
		let wire: &[u8] = &[
			0x05, 0x00, // server picks no-auth
			0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, // succeeded
		];
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let parser = Socks5Parser::new(None);
		let target = TargetAddr::from_host_port("1.2.3.4", 80);
		parser.connect(&mut rd, &mut wr, &target).await?;
		assert_eq!(&wr[..], &[
			0x05, 0x02, 0x00, 0x02, // greeting advertising no-auth + user-auth
			0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50,
		]);
		Ok(())
	}

	#[tokio::test]
	async fn client_rejects_failure_reply() {
		let wire: &[u8] = &[
			0x05, 0x00, // no-auth
			0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0, // connection refused
		];
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let parser = Socks5Parser::new(None);
		let target = TargetAddr::from_host_port("1.2.3.4", 80);
		let err = parser.connect(&mut rd, &mut wr, &target).await.unwrap_err();
		assert!(matches!(err, ProtoError::Rejected { .. }));
	}

	#[test]
	fn refusal_mapping() {
		assert_eq!(Rep::from(Refusal::NotAllowed), Rep::NotAllowed);
		assert_eq!(Rep::from(Refusal::ConnectionRefused), Rep::ConnectionRefused);
		assert_eq!(Rep::from(Refusal::HostUnreachable), Rep::HostUnreachable);
		assert_eq!(Rep::from(Refusal::General), Rep::GeneralFailure);
	}
}
