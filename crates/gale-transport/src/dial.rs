//! Outbound dialing: direct TCP toward the target, or the transport
//! leg of a chained outbound route.

use std::sync::Arc;

use gale_core::{
	types::TargetAddr,
	url::{RouteSpec, TransportKind},
};
use rustls::pki_types::ServerName;
use snafu::{IntoError as _, ResultExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::{
	DialSnafu, Error, ServerNameSnafu, WsHandshakeSnafu,
	quic::QuicConnector,
	stream::{ProxyStream, WsInner},
	tls,
	ws::WsStream,
};

const DIAL_ATTEMPTS: usize = 2;

async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, Error> {
	let mut last = None;
	for attempt in 1..=DIAL_ATTEMPTS {
		match TcpStream::connect((host, port)).await {
			Ok(stream) => return Ok(stream),
			Err(err) => {
				debug!(%host, port, attempt, "dial attempt failed: {err}");
				last = Some(err);
			}
		}
	}
	let source = last.unwrap_or_else(|| std::io::Error::other("no dial attempt made"));
	Err(DialSnafu {
		target: format!("{host}:{port}"),
	}
	.into_error(source))
}

/// Direct TCP to the target, two attempts before surfacing the error.
pub async fn dial_direct(target: &TargetAddr) -> Result<ProxyStream, Error> {
	let stream = connect_tcp(&target.host(), target.port()).await?;
	Ok(ProxyStream::Tcp(stream))
}

/// The transport side of one outbound route. Stateless except for the
/// shared QUIC connection.
pub struct Outbound {
	spec: RouteSpec,
	tls:  Option<TlsConnector>,
	quic: Option<QuicConnector>,
}

impl Outbound {
	pub fn new(spec: RouteSpec) -> Result<Self, Error> {
		let tls = match spec.transport {
			TransportKind::Tls | TransportKind::Wss => {
				let config = tls::client_config(spec.verify_ssl)?;
				Some(TlsConnector::from(Arc::new(config)))
			}
			_ => None,
		};
		let quic = match spec.transport {
			TransportKind::Quic => Some(QuicConnector::new(&spec.host, spec.port, spec.verify_ssl)?),
			_ => None,
		};
		Ok(Outbound { spec, tls, quic })
	}

	pub fn spec(&self) -> &RouteSpec {
		&self.spec
	}

	pub async fn dial(&self) -> Result<ProxyStream, Error> {
		match self.spec.transport {
			TransportKind::Tcp => {
				let stream = connect_tcp(&self.spec.host, self.spec.port).await?;
				Ok(ProxyStream::Tcp(stream))
			}
			TransportKind::Tls => {
				let stream = self.connect_tls().await?;
				Ok(ProxyStream::Tls(Box::new(tokio_rustls::TlsStream::Client(stream))))
			}
			TransportKind::Quic => {
				let quic = match &self.quic {
					Some(quic) => quic,
					None => unreachable!("built in Outbound::new for quic transports"),
				};
				Ok(ProxyStream::Quic(quic.open().await?))
			}
			TransportKind::Ws => {
				let stream = connect_tcp(&self.spec.host, self.spec.port).await?;
				self.upgrade_ws(WsInner::Plain(stream), "ws").await
			}
			TransportKind::Wss => {
				let stream = self.connect_tls().await?;
				self.upgrade_ws(WsInner::Tls(Box::new(tokio_rustls::TlsStream::Client(stream))), "wss")
					.await
			}
		}
	}

	async fn connect_tls(&self) -> Result<tokio_rustls::client::TlsStream<TcpStream>, Error> {
		let connector = match &self.tls {
			Some(connector) => connector,
			None => unreachable!("built in Outbound::new for tls transports"),
		};
		let stream = connect_tcp(&self.spec.host, self.spec.port).await?;
		let server_name = ServerName::try_from(self.spec.host.clone())
			.map_err(|_| ServerNameSnafu { name: self.spec.host.clone() }.build())?;
		Ok(connector.connect(server_name, stream).await?)
	}

	async fn upgrade_ws(&self, inner: WsInner, scheme: &str) -> Result<ProxyStream, Error> {
		let path = self.spec.path.as_deref().unwrap_or("/");
		let url = format!("{scheme}://{}:{}{path}", self.spec.host, self.spec.port);
		let (ws, _response) = tokio_tungstenite::client_async(url.as_str(), inner)
			.await
			.map_err(Box::new)
			.context(WsHandshakeSnafu)?;
		Ok(ProxyStream::Ws(Box::new(WsStream::new(ws))))
	}
}
