//! Dispatch from a route's proxy kind to the concrete state machine.
//!
//! A server half runs in three phases: `accept` parses the handshake
//! up to target extraction, the orchestrator dials the outbound, then
//! `finish` (or `refuse`) completes the exchange. A client half is a
//! single `connect` call against the freshly dialed transport.

use gale_core::{buffer::StreamBuffer, types::TargetAddr, url::ProxyKind};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
	ProtoError, Refusal, http::HttpParser, socks4::Socks4Parser, socks5::Socks5Parser, ss::SsParser,
	trojan::TrojanParser,
};

pub enum ProxyParser {
	Socks5(Socks5Parser),
	Socks4(Socks4Parser),
	Http(HttpParser),
	Trojan(TrojanParser),
	Ss(SsParser),
}

impl ProxyParser {
	/// `ss` and `plain` share the address-then-payload parser; the
	/// AEAD layer is a property of the stream, not of the parser.
	pub fn new(proxy: ProxyKind, credentials: Option<(String, String)>) -> Self {
		match proxy {
			ProxyKind::Socks5 => ProxyParser::Socks5(Socks5Parser::new(credentials)),
			ProxyKind::Socks4 => ProxyParser::Socks4(Socks4Parser),
			ProxyKind::Http => ProxyParser::Http(HttpParser::new(credentials)),
			ProxyKind::Trojan => ProxyParser::Trojan(TrojanParser::new(credentials)),
			ProxyKind::Ss | ProxyKind::Plain => ProxyParser::Ss(SsParser),
		}
	}

	pub async fn accept<R, W>(&self, rd: &mut StreamBuffer<R>, wr: &mut W) -> Result<TargetAddr, ProtoError>
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		match self {
			ProxyParser::Socks5(parser) => parser.accept(rd, wr).await,
			ProxyParser::Socks4(parser) => parser.accept(rd, wr).await,
			ProxyParser::Http(parser) => parser.accept(rd, wr).await,
			ProxyParser::Trojan(parser) => parser.accept(rd, wr).await,
			ProxyParser::Ss(parser) => parser.accept(rd, wr).await,
		}
	}

	pub async fn finish<W>(&self, wr: &mut W) -> Result<(), ProtoError>
	where
		W: AsyncWrite + Unpin,
	{
		match self {
			ProxyParser::Socks5(parser) => parser.finish(wr).await,
			ProxyParser::Socks4(parser) => parser.finish(wr).await,
			ProxyParser::Http(parser) => parser.finish(wr).await,
			ProxyParser::Trojan(parser) => parser.finish(wr).await,
			ProxyParser::Ss(parser) => parser.finish(wr).await,
		}
	}

	pub async fn refuse<W>(&self, wr: &mut W, refusal: Refusal) -> Result<(), ProtoError>
	where
		W: AsyncWrite + Unpin,
	{
		match self {
			ProxyParser::Socks5(parser) => parser.refuse(wr, refusal).await,
			ProxyParser::Socks4(parser) => parser.refuse(wr, refusal).await,
			ProxyParser::Http(parser) => parser.refuse(wr, refusal).await,
			ProxyParser::Trojan(parser) => parser.refuse(wr, refusal).await,
			ProxyParser::Ss(parser) => parser.refuse(wr, refusal).await,
		}
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
		match self {
			ProxyParser::Socks5(parser) => parser.connect(rd, wr, target).await,
			ProxyParser::Socks4(parser) => parser.connect(rd, wr, target).await,
			ProxyParser::Http(parser) => parser.connect(rd, wr, target).await,
			ProxyParser::Trojan(parser) => parser.connect(rd, wr, target).await,
			ProxyParser::Ss(parser) => parser.connect(rd, wr, target).await,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	/// A server half and a client half of the same protocol wired
	/// back-to-back must agree on the target.
	#[tokio::test]
	async fn halves_agree_on_target() -> eyre::Result<()> {
		for proxy in [ProxyKind::Socks5, ProxyKind::Http, ProxyKind::Trojan, ProxyKind::Plain] {
			let creds = Some((String::from("u"), String::from("p")));
			let client = ProxyParser::new(proxy, creds.clone());
			let server = ProxyParser::new(proxy, creds);
			let target = TargetAddr::from_host_port("example.com", 8443);

			let (near, far) = tokio::io::duplex(16 * 1024);
			let (mut crd, mut cwr) = tokio::io::split(near);
			let (srd, mut swr) = tokio::io::split(far);
			let mut crd = StreamBuffer::new(&mut crd);
			let mut srd = StreamBuffer::new(srd);

			let connect = async {
				client.connect(&mut crd, &mut cwr, &target).await
			};
			let serve = async {
				let got = server.accept(&mut srd, &mut swr).await?;
				server.finish(&mut swr).await?;
				Ok::<_, ProtoError>(got)
			};
			let (connected, accepted) = tokio::join!(connect, serve);
			connected?;
			assert_eq!(accepted?, target);
		}
		Ok(())
	}
}
