//! Trojan (trojan-gfw) header, server and client halves.
//!
//! ```text
//! +-----------------------+---------+----------------+---------+----------+
//! | hex(SHA224(password)) |  CRLF   | CMD ATYP ADDR  |  CRLF   | payload  |
//! +-----------------------+---------+----------------+---------+----------+
//! |          56           | X'0D0A' |    variable    | X'0D0A' | variable |
//! +-----------------------+---------+----------------+---------+----------+
//! ```
//!
//! There is no acknowledgment frame; everything after the second CRLF
//! is already relay payload. An authentication mismatch closes the
//! connection without a reply, since the protocol defines none.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use gale_core::{buffer::StreamBuffer, types::TargetAddr};
use sha2::{Digest, Sha224};
use snafu::ensure;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::{
	AuthFailedSnafu, MalformedSnafu, NotSupportedSnafu, ProtoError, Refusal,
	addr::{AddrCodec, wire_len},
	socks5::Cmd,
	truncated,
};

const KEY_LEN: usize = 56;
const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
	pub key:  Bytes,
	pub cmd:  Cmd,
	pub addr: TargetAddr,
}

#[derive(Debug, Clone, Copy)]
pub struct HeaderCodec;

impl Decoder for HeaderCodec {
	type Error = ProtoError;
	type Item = Header;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < KEY_LEN + 2 + 1 {
			return Ok(None);
		}
		let Some(addr_len) = wire_len(&src[KEY_LEN + 3..])? else {
			return Ok(None);
		};
		let total = KEY_LEN + 2 + 1 + addr_len + 2;
		if src.len() < total {
			return Ok(None);
		}

		let key = src.split_to(KEY_LEN).freeze();
		ensure!(
			&src[..2] == CRLF,
			MalformedSnafu {
				what:   "trojan header",
				detail: String::from("missing CRLF after credential"),
			}
		);
		src.advance(2);
		let cmd = Cmd::from(src.get_u8());
		let addr = match AddrCodec.decode(src)? {
			Some(addr) => addr,
			None => unreachable!("address length was checked"),
		};
		ensure!(
			&src[..2] == CRLF,
			MalformedSnafu {
				what:   "trojan header",
				detail: String::from("missing CRLF after address"),
			}
		);
		src.advance(2);
		Ok(Some(Header { key, cmd, addr }))
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(src)? {
			Some(item) => Ok(Some(item)),
			None if src.is_empty() => Ok(None),
			None => Err(truncated()),
		}
	}
}

impl Encoder<&Header> for HeaderCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: &Header, dst: &mut BytesMut) -> Result<(), Self::Error> {
		ensure!(
			item.key.len() == KEY_LEN,
			MalformedSnafu {
				what:   "trojan credential",
				detail: format!("{} bytes, expected {KEY_LEN}", item.key.len()),
			}
		);
		dst.reserve(KEY_LEN + 2 + 1);
		dst.put_slice(&item.key);
		dst.put_slice(CRLF);
		dst.put_u8(item.cmd.into());
		AddrCodec.encode(&item.addr, dst)?;
		dst.put_slice(CRLF);
		Ok(())
	}
}

fn credential_hex(credentials: Option<&(String, String)>) -> Bytes {
	let raw = match credentials {
		Some((username, password)) => format!("{username}:{password}"),
		None => String::new(),
	};
	Bytes::from(hex::encode(Sha224::digest(raw.as_bytes())).into_bytes())
}

pub struct TrojanParser {
	key_hex: Bytes,
	// Inbounds without configured credentials accept any header.
	enforce: bool,
}

impl TrojanParser {
	pub fn new(credentials: Option<(String, String)>) -> Self {
		TrojanParser {
			enforce: credentials.is_some(),
			key_hex: credential_hex(credentials.as_ref()),
		}
	}

	pub async fn accept<R, W>(&self, rd: &mut StreamBuffer<R>, _wr: &mut W) -> Result<TargetAddr, ProtoError>
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		let header = rd.pull(&mut HeaderCodec).await?;
		if self.enforce && header.key != self.key_hex {
			debug!("trojan credential mismatch");
			return AuthFailedSnafu.fail();
		}
		ensure!(
			header.cmd == Cmd::Connect,
			NotSupportedSnafu {
				what: format!("trojan command {:?}", header.cmd),
			}
		);
		Ok(header.addr)
	}

	/// Trojan has no acknowledgment frame.
	pub async fn finish<W>(&self, _wr: &mut W) -> Result<(), ProtoError>
	where
		W: AsyncWrite + Unpin,
	{
		Ok(())
	}

	/// No rejection frame either; the close itself is the answer.
	pub async fn refuse<W>(&self, _wr: &mut W, _refusal: Refusal) -> Result<(), ProtoError>
	where
		W: AsyncWrite + Unpin,
	{
		Ok(())
	}

	pub async fn connect<R, W>(
		&self,
		_rd: &mut StreamBuffer<R>,
		wr: &mut W,
		target: &TargetAddr,
	) -> Result<(), ProtoError>
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		let mut buf = BytesMut::new();
		HeaderCodec.encode(
			&Header {
				key:  self.key_hex.clone(),
				cmd:  Cmd::Connect,
				addr: target.clone(),
			},
			&mut buf,
		)?;
		wr.write_all(&buf).await?;
		wr.flush().await?;
		Ok(())
	}
}
