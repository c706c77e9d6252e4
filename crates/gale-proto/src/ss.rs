//! Shadowsocks stream protocol: a single address header, then raw
//! payload. The AEAD dialect runs this same parser over an
//! [`AeadStream`](crate::aead::AeadStream); the plain dialect runs it
//! over the bare transport.

use bytes::BytesMut;
use gale_core::{buffer::StreamBuffer, types::TargetAddr};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Encoder;

use crate::{ProtoError, Refusal, addr::AddrCodec};

pub struct SsParser;

impl SsParser {
	pub async fn accept<R, W>(&self, rd: &mut StreamBuffer<R>, _wr: &mut W) -> Result<TargetAddr, ProtoError>
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		rd.pull(&mut AddrCodec).await
	}

	/// No reply stream; relay payload follows the address directly.
	pub async fn finish<W>(&self, _wr: &mut W) -> Result<(), ProtoError>
	where
		W: AsyncWrite + Unpin,
	{
		Ok(())
	}

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
		AddrCodec.encode(target, &mut buf)?;
		wr.write_all(&buf).await?;
		wr.flush().await?;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::{aead::AeadStream, cipher::Cipher};

	#[tokio::test]
	async fn plain_address_then_payload() -> eyre::Result<()> {
		let mut wire = BytesMut::new();
		let target = TargetAddr::from_host_port("httpbin.org", 80);
		AddrCodec.encode(&target, &mut wire)?;
		wire.extend_from_slice(b"GET /ip HTTP/1.1\r\n");

		let mut rd = StreamBuffer::new(&wire[..]);
		let mut wr = Vec::new();
		assert_eq!(SsParser.accept(&mut rd, &mut wr).await?, target);
		assert_eq!(&rd.read_all()[..], b"GET /ip HTTP/1.1\r\n");
		Ok(())
	}

	/// Client and server halves over a sealed pipe: the address header
	/// and the first payload bytes travel as AEAD frames.
	#[tokio::test]
	async fn sealed_handshake() -> eyre::Result<()> {
		use tokio::io::AsyncWriteExt as _;

		let cipher = Cipher::new("test");
		let (near, far) = tokio::io::duplex(64 * 1024);
		let mut client = AeadStream::new(near, cipher.clone());
		let server = AeadStream::new(far, cipher);

		let target = TargetAddr::from_host_port("1.2.3.4", 443);
		{
			let (mut crd, mut cwr) = tokio::io::split(&mut client);
			let mut crd = StreamBuffer::new(&mut crd);
			SsParser.connect(&mut crd, &mut cwr, &target).await?;
		}
		client.write_all(b"payload").await?;
		client.shutdown().await?;

		let (srd, mut swr) = tokio::io::split(server);
		let mut srd = StreamBuffer::new(srd);
		assert_eq!(SsParser.accept(&mut srd, &mut swr).await?, target);
		let mut rest = Vec::new();
		loop {
			let chunk = srd.read(4096).await?;
			if chunk.is_empty() {
				break;
			}
			rest.extend_from_slice(&chunk);
		}
		assert_eq!(&rest, b"payload");
		Ok(())
	}
}
