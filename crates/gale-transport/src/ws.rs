//! WebSocket binary frames presented as a byte stream.
//!
//! Every write becomes one binary message; incoming binary (or text)
//! messages are staged and drained byte-wise. A Close frame or a
//! closed connection reads as EOF, and shutdown sends a Close frame --
//! WebSocket has no half-close.

use std::{
	io,
	pin::Pin,
	task::{Context, Poll},
};

use bytes::BytesMut;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
	WebSocketStream,
	tungstenite::{Error as WsError, Message},
};

pub struct WsStream<S> {
	inner:   WebSocketStream<S>,
	staging: BytesMut,
}

fn ws_err(err: WsError) -> io::Error {
	match err {
		WsError::Io(err) => err,
		other => io::Error::other(other),
	}
}

impl<S> WsStream<S> {
	pub fn new(inner: WebSocketStream<S>) -> Self {
		WsStream {
			inner,
			staging: BytesMut::new(),
		}
	}
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsStream<S> {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		loop {
			if !this.staging.is_empty() {
				let num = this.staging.len().min(buf.remaining());
				buf.put_slice(&this.staging.split_to(num));
				return Poll::Ready(Ok(()));
			}
			match Pin::new(&mut this.inner).poll_next(cx) {
				Poll::Ready(Some(Ok(Message::Binary(data)))) => {
					this.staging.extend_from_slice(&data);
				}
				Poll::Ready(Some(Ok(Message::Text(text)))) => {
					this.staging.extend_from_slice(text.as_bytes());
				}
				// Control frames are answered by tungstenite itself.
				Poll::Ready(Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)))) => {}
				Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
					return Poll::Ready(Ok(()));
				}
				Poll::Ready(Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed))) => {
					return Poll::Ready(Ok(()));
				}
				Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(ws_err(err))),
				Poll::Pending => return Poll::Pending,
			}
		}
	}
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsStream<S> {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		match Pin::new(&mut this.inner).poll_ready(cx) {
			Poll::Ready(Ok(())) => {}
			Poll::Ready(Err(err)) => return Poll::Ready(Err(ws_err(err))),
			Poll::Pending => return Poll::Pending,
		}
		match Pin::new(&mut this.inner).start_send(Message::binary(buf.to_vec())) {
			Ok(()) => Poll::Ready(Ok(buf.len())),
			Err(err) => Poll::Ready(Err(ws_err(err))),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		Pin::new(&mut this.inner).poll_flush(cx).map_err(ws_err)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		match Pin::new(&mut this.inner).poll_close(cx) {
			Poll::Ready(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => Poll::Ready(Ok(())),
			other => other.map_err(ws_err),
		}
	}
}
