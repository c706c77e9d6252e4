//! Uniform listener facade. `accept` hands back a [`Pending`] plus the
//! peer address as fast as possible; the per-connection TLS or
//! WebSocket handshake runs inside the session task via
//! [`Pending::establish`], so one slow client cannot stall the accept
//! loop. QUIC connections fan their bidi streams into the same shape
//! through a channel.

use std::{net::SocketAddr, sync::Arc};

use gale_core::{policy::DestPolicy, url::{RouteSpec, TransportKind}};
use snafu::{OptionExt, ResultExt};
use tokio::{
	net::{TcpListener, TcpStream},
	sync::mpsc,
};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::{
	handshake::server::{ErrorResponse, Request, Response},
	http::StatusCode,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
	BindSocketSnafu, Error, ListenerClosedSnafu, MissingIdentitySnafu, WsHandshakeSnafu,
	quic::{self, QuicStream},
	stream::{ProxyStream, WsInner},
	tls::{self, TlsIdentity},
	ws::WsStream,
};

/// Upgrade-time checks for ws/wss inbounds: route path and the
/// CDN-stamped origin country.
pub struct WsUpgrade {
	pub path:   Option<String>,
	pub policy: Arc<DestPolicy>,
}

pub struct Acceptor {
	local_addr: SocketAddr,
	kind:       AcceptorKind,
	cancel:     CancellationToken,
}

enum AcceptorKind {
	Tcp(TcpListener),
	Tls(TcpListener, TlsAcceptor),
	Ws(TcpListener, Arc<WsUpgrade>),
	Wss(TcpListener, TlsAcceptor, Arc<WsUpgrade>),
	Quic(mpsc::Receiver<(QuicStream, SocketAddr)>),
}

/// An accepted connection whose per-connection handshake (if any) has
/// not run yet.
pub struct Pending {
	kind: PendingKind,
}

enum PendingKind {
	Ready(ProxyStream),
	Tls(TcpStream, TlsAcceptor),
	Ws(TcpStream, Arc<WsUpgrade>),
	Wss(TcpStream, TlsAcceptor, Arc<WsUpgrade>),
}

impl Acceptor {
	/// Binds the listener described by `spec`. TLS-carrying transports
	/// need the identity; ws/wss additionally honor the route path and
	/// the policy's country block.
	pub async fn bind(
		spec: &RouteSpec,
		identity: Option<TlsIdentity>,
		policy: Arc<DestPolicy>,
	) -> Result<Self, Error> {
		let cancel = CancellationToken::new();
		let upgrade = Arc::new(WsUpgrade {
			path: spec.path.clone(),
			policy,
		});

		let bind_addr = (spec.host.as_str(), spec.port);
		let kind = match spec.transport {
			TransportKind::Quic => {
				let listen = resolve_bind(bind_addr).await?;
				let identity = identity.context(MissingIdentitySnafu { transport: "quic" })?;
				let endpoint = quic::server_endpoint(listen, identity)?;
				let local_addr = endpoint.local_addr()?;
				let (tx, rx) = mpsc::channel(16);
				spawn_quic_listener(endpoint, tx, cancel.clone());
				return Ok(Acceptor {
					local_addr,
					kind: AcceptorKind::Quic(rx),
					cancel,
				});
			}
			TransportKind::Tcp => AcceptorKind::Tcp(tcp_listener(bind_addr).await?),
			TransportKind::Tls => {
				let identity = identity.context(MissingIdentitySnafu { transport: "tls" })?;
				AcceptorKind::Tls(tcp_listener(bind_addr).await?, tls::acceptor(identity)?)
			}
			TransportKind::Ws => AcceptorKind::Ws(tcp_listener(bind_addr).await?, upgrade),
			TransportKind::Wss => {
				let identity = identity.context(MissingIdentitySnafu { transport: "wss" })?;
				AcceptorKind::Wss(tcp_listener(bind_addr).await?, tls::acceptor(identity)?, upgrade)
			}
		};
		let local_addr = match &kind {
			AcceptorKind::Tcp(listener)
			| AcceptorKind::Tls(listener, _)
			| AcceptorKind::Ws(listener, _)
			| AcceptorKind::Wss(listener, _, _) => listener.local_addr()?,
			AcceptorKind::Quic(_) => unreachable!("handled above"),
		};
		Ok(Acceptor { local_addr, kind, cancel })
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub async fn accept(&mut self) -> Result<(Pending, SocketAddr), Error> {
		match &mut self.kind {
			AcceptorKind::Tcp(listener) => {
				let (stream, peer) = listener.accept().await?;
				Ok((
					Pending {
						kind: PendingKind::Ready(ProxyStream::Tcp(stream)),
					},
					peer,
				))
			}
			AcceptorKind::Tls(listener, acceptor) => {
				let (stream, peer) = listener.accept().await?;
				Ok((
					Pending {
						kind: PendingKind::Tls(stream, acceptor.clone()),
					},
					peer,
				))
			}
			AcceptorKind::Ws(listener, upgrade) => {
				let (stream, peer) = listener.accept().await?;
				Ok((
					Pending {
						kind: PendingKind::Ws(stream, upgrade.clone()),
					},
					peer,
				))
			}
			AcceptorKind::Wss(listener, acceptor, upgrade) => {
				let (stream, peer) = listener.accept().await?;
				Ok((
					Pending {
						kind: PendingKind::Wss(stream, acceptor.clone(), upgrade.clone()),
					},
					peer,
				))
			}
			AcceptorKind::Quic(rx) => {
				let (stream, peer) = rx.recv().await.context(ListenerClosedSnafu)?;
				Ok((
					Pending {
						kind: PendingKind::Ready(ProxyStream::Quic(stream)),
					},
					peer,
				))
			}
		}
	}
}

impl Drop for Acceptor {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

impl Pending {
	/// Runs the per-connection TLS/WebSocket handshake, if any.
	pub async fn establish(self) -> Result<ProxyStream, Error> {
		match self.kind {
			PendingKind::Ready(stream) => Ok(stream),
			PendingKind::Tls(stream, acceptor) => {
				let stream = acceptor.accept(stream).await?;
				Ok(ProxyStream::Tls(Box::new(tokio_rustls::TlsStream::Server(stream))))
			}
			PendingKind::Ws(stream, upgrade) => {
				let inner = WsInner::Plain(stream);
				let ws = tokio_tungstenite::accept_hdr_async(inner, upgrade_callback(upgrade))
					.await
					.map_err(Box::new)
					.context(WsHandshakeSnafu)?;
				Ok(ProxyStream::Ws(Box::new(WsStream::new(ws))))
			}
			PendingKind::Wss(stream, acceptor, upgrade) => {
				let stream = acceptor.accept(stream).await?;
				let inner = WsInner::Tls(Box::new(tokio_rustls::TlsStream::Server(stream)));
				let ws = tokio_tungstenite::accept_hdr_async(inner, upgrade_callback(upgrade))
					.await
					.map_err(Box::new)
					.context(WsHandshakeSnafu)?;
				Ok(ProxyStream::Ws(Box::new(WsStream::new(ws))))
			}
		}
	}
}

fn reject(status: StatusCode) -> ErrorResponse {
	let mut response = ErrorResponse::new(None);
	*response.status_mut() = status;
	response
}

fn upgrade_callback(upgrade: Arc<WsUpgrade>) -> impl FnOnce(&Request, Response) -> Result<Response, ErrorResponse> {
	move |request: &Request, response: Response| {
		if let Some(path) = &upgrade.path {
			if request.uri().path() != path {
				debug!(got = %request.uri().path(), want = %path, "ws path mismatch");
				return Err(reject(StatusCode::NOT_FOUND));
			}
		}
		if let Some(country) = request
			.headers()
			.get("CF-IPCountry")
			.and_then(|value| value.to_str().ok())
		{
			if upgrade.policy.check_country(country).is_err() {
				debug!(%country, "blocked by country policy");
				return Err(reject(StatusCode::FORBIDDEN));
			}
		}
		Ok(response)
	}
}

async fn tcp_listener(bind_addr: (&str, u16)) -> Result<TcpListener, Error> {
	let socket_addr = resolve_bind(bind_addr).await?;
	TcpListener::bind(socket_addr).await.context(BindSocketSnafu { socket_addr })
}

async fn resolve_bind(bind_addr: (&str, u16)) -> Result<SocketAddr, Error> {
	use snafu::IntoError as _;

	tokio::net::lookup_host(bind_addr)
		.await?
		.next()
		.ok_or_else(|| {
			crate::IoSnafu.into_error(std::io::Error::new(
				std::io::ErrorKind::AddrNotAvailable,
				"listen address did not resolve",
			))
		})
}

/// Accepts QUIC connections and fans every bidi stream in as one
/// logical session.
fn spawn_quic_listener(
	endpoint: quinn::Endpoint,
	tx: mpsc::Sender<(QuicStream, SocketAddr)>,
	cancel: CancellationToken,
) {
	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
					break;
				}
				incoming = endpoint.accept() => {
					let Some(incoming) = incoming else { break };
					let tx = tx.clone();
					let cancel = cancel.clone();
					tokio::spawn(async move {
						let remote = incoming.remote_address();
						let connection = match incoming.await {
							Ok(connection) => connection,
							Err(err) => {
								warn!(%remote, "quic handshake failed: {err}");
								return;
							}
						};
						debug!(%remote, "quic connection established");
						loop {
							tokio::select! {
								_ = cancel.cancelled() => break,
								accepted = connection.accept_bi() => match accepted {
									Ok((send, recv)) => {
										if tx.send((QuicStream::new(send, recv), remote)).await.is_err() {
											break;
										}
									}
									Err(err) => {
										debug!(%remote, "quic connection ended: {err}");
										break;
									}
								}
							}
						}
					});
				}
			}
		}
	});
}
