//! Per-connection pipeline: establish, parse the inbound handshake,
//! gate the target, dial the outbound leg, then couple the relays.

use std::{
	io,
	net::SocketAddr,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
};

use gale_core::{
	buffer::StreamBuffer,
	relay::couple,
	types::TargetAddr,
};
use gale_proto::{Refusal, aead::AeadStream, parser::ProxyParser};
use gale_transport::{Error as TransportError, Pending, ProxyStream, dial_direct};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tracing::{debug, info};

use crate::route::Route;

/// A transport stream, possibly wrapped in the Shadowsocks AEAD layer.
enum SessionStream {
	Raw(ProxyStream),
	Sealed(Box<AeadStream<ProxyStream>>),
}

impl AsyncRead for SessionStream {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			SessionStream::Raw(inner) => Pin::new(inner).poll_read(cx, buf),
			SessionStream::Sealed(inner) => Pin::new(inner).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for SessionStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match self.get_mut() {
			SessionStream::Raw(inner) => Pin::new(inner).poll_write(cx, buf),
			SessionStream::Sealed(inner) => Pin::new(inner).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			SessionStream::Raw(inner) => Pin::new(inner).poll_flush(cx),
			SessionStream::Sealed(inner) => Pin::new(inner).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			SessionStream::Raw(inner) => Pin::new(inner).poll_shutdown(cx),
			SessionStream::Sealed(inner) => Pin::new(inner).poll_shutdown(cx),
		}
	}
}

struct OutboundLeg {
	rd:         StreamBuffer<ReadHalf<SessionStream>>,
	wr:         WriteHalf<SessionStream>,
	half_close: bool,
}

/// Entry point spawned per accepted connection. Errors end this
/// session only; they are logged and never propagate to the listener.
pub async fn handle(route: Arc<Route>, pending: Pending, peer: SocketAddr) {
	if let Err(err) = run(route, pending, peer).await {
		debug!(target: "gale::session", %peer, "session ended: {err:#}");
	}
}

fn owned_credentials(spec: &gale_core::url::RouteSpec) -> Option<(String, String)> {
	spec.credentials().map(|(user, pass)| (user.to_owned(), pass.to_owned()))
}

fn refusal_for_transport(err: &TransportError) -> Refusal {
	match err {
		TransportError::Dial { source, .. } | TransportError::Io { source, .. } => Refusal::from_io(source),
		TransportError::QuicConnect { .. } | TransportError::QuicConnection { .. } => Refusal::HostUnreachable,
		_ => Refusal::General,
	}
}

async fn run(route: Arc<Route>, pending: Pending, peer: SocketAddr) -> eyre::Result<()> {
	let stream = pending.establish().await?;
	let inbound_half_close = stream.half_close_capable();
	let stream = match &route.inbound_cipher {
		Some(cipher) => SessionStream::Sealed(Box::new(AeadStream::new(stream, cipher.clone()))),
		None => SessionStream::Raw(stream),
	};

	let parser = ProxyParser::new(route.inbound.proxy, owned_credentials(&route.inbound));
	let (rd, mut wr) = tokio::io::split(stream);
	let mut rd = StreamBuffer::new(rd);

	let target = match parser.accept(&mut rd, &mut wr).await {
		Ok(target) => target,
		Err(err) => {
			let _ = wr.shutdown().await;
			return Err(err.into());
		}
	};
	debug!(target: "gale::session", %peer, %target, "handshake complete");

	if let Err(err) = route.policy.check(&target) {
		let _ = parser.refuse(&mut wr, Refusal::NotAllowed).await;
		let _ = wr.shutdown().await;
		return Err(err.into());
	}

	let outbound = match dial(&route, &target).await {
		Ok(outbound) => outbound,
		Err((refusal, err)) => {
			let _ = parser.refuse(&mut wr, refusal).await;
			let _ = wr.shutdown().await;
			return Err(err);
		}
	};

	parser.finish(&mut wr).await?;
	info!(target: "gale::session", %peer, %target, "relay open");

	let up = route.ul.as_ref().map(|map| map.get(peer.ip()));
	let down = route.dl.as_ref().map(|map| map.get(peer.ip()));
	let (uploaded, downloaded, err) = couple(
		rd,
		wr,
		outbound.rd,
		outbound.wr,
		up,
		down,
		inbound_half_close,
		outbound.half_close,
	)
	.await;
	match err {
		Some(err) => debug!(target: "gale::session", %peer, %target, uploaded, downloaded, "relay closed: {err}"),
		None => info!(target: "gale::session", %peer, %target, uploaded, downloaded, "relay closed"),
	}
	Ok(())
}

/// Dials the outbound leg: straight to the target, or through the
/// chained outbound route (transport dial, then its proxy handshake).
async fn dial(route: &Route, target: &TargetAddr) -> Result<OutboundLeg, (Refusal, eyre::Report)> {
	match &route.outbound {
		None => {
			let stream = dial_direct(target)
				.await
				.map_err(|err| (refusal_for_transport(&err), eyre::Report::new(err)))?;
			let (rd, wr) = tokio::io::split(SessionStream::Raw(stream));
			Ok(OutboundLeg {
				rd: StreamBuffer::new(rd),
				wr,
				half_close: true,
			})
		}
		Some(outbound) => {
			let stream = outbound
				.dial()
				.await
				.map_err(|err| (refusal_for_transport(&err), eyre::Report::new(err)))?;
			let half_close = stream.half_close_capable();
			let stream = match &route.outbound_cipher {
				Some(cipher) => SessionStream::Sealed(Box::new(AeadStream::new(stream, cipher.clone()))),
				None => SessionStream::Raw(stream),
			};

			let parser = ProxyParser::new(outbound.spec().proxy, owned_credentials(outbound.spec()));
			let (rd, mut wr) = tokio::io::split(stream);
			let mut rd = StreamBuffer::new(rd);
			parser
				.connect(&mut rd, &mut wr, target)
				.await
				.map_err(|err| (Refusal::General, eyre::Report::new(err)))?;

			Ok(OutboundLeg { rd, wr, half_close })
		}
	}
}
