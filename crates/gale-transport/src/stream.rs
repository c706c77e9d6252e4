//! The uniform stream type protocol parsers run over.

use std::{
	io,
	pin::Pin,
	task::{Context, Poll},
};

use tokio::{
	io::{AsyncRead, AsyncWrite, ReadBuf},
	net::TcpStream,
};

use crate::{quic::QuicStream, ws::WsStream};

/// Plain or TLS-wrapped TCP carrying WebSocket frames.
pub enum WsInner {
	Plain(TcpStream),
	Tls(Box<tokio_rustls::TlsStream<TcpStream>>),
}

/// One accepted or dialed connection, any transport. Parsers never see
/// which variant they run over.
pub enum ProxyStream {
	Tcp(TcpStream),
	Tls(Box<tokio_rustls::TlsStream<TcpStream>>),
	Quic(QuicStream),
	Ws(Box<WsStream<WsInner>>),
}

impl ProxyStream {
	/// WebSocket has no half-close: a Close frame ends both directions,
	/// so relay EOF handling must treat it as a full close.
	pub fn half_close_capable(&self) -> bool {
		!matches!(self, ProxyStream::Ws(_))
	}
}

macro_rules! dispatch {
	($self:ident, $inner:ident => $expr:expr) => {
		match $self.get_mut() {
			ProxyStream::Tcp($inner) => $expr,
			ProxyStream::Tls($inner) => $expr,
			ProxyStream::Quic($inner) => $expr,
			ProxyStream::Ws($inner) => $expr,
		}
	};
}

impl AsyncRead for ProxyStream {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		dispatch!(self, inner => Pin::new(inner).poll_read(cx, buf))
	}
}

impl AsyncWrite for ProxyStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		dispatch!(self, inner => Pin::new(inner).poll_write(cx, buf))
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		dispatch!(self, inner => Pin::new(inner).poll_flush(cx))
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		dispatch!(self, inner => Pin::new(inner).poll_shutdown(cx))
	}
}

impl AsyncRead for WsInner {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			WsInner::Plain(inner) => Pin::new(inner).poll_read(cx, buf),
			WsInner::Tls(inner) => Pin::new(inner).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for WsInner {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match self.get_mut() {
			WsInner::Plain(inner) => Pin::new(inner).poll_write(cx, buf),
			WsInner::Tls(inner) => Pin::new(inner).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			WsInner::Plain(inner) => Pin::new(inner).poll_flush(cx),
			WsInner::Tls(inner) => Pin::new(inner).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			WsInner::Plain(inner) => Pin::new(inner).poll_shutdown(cx),
			WsInner::Tls(inner) => Pin::new(inner).poll_shutdown(cx),
		}
	}
}
