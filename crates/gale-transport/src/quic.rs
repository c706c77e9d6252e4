//! QUIC transport: one bidi stream per session over a connection that
//! outbound routes share and lazily redial.

use std::{
	io,
	net::{Ipv4Addr, SocketAddr},
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
	time::Duration,
};

use quinn::{RecvStream, SendStream, TransportConfig, VarInt};
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::{
	BindSocketSnafu, DialSnafu, Error, QuicConnectSnafu, QuicConnectionSnafu, TlsConfigSnafu,
	tls::{self, TlsIdentity},
};

/// Both ends of a route speak this ALPN to each other.
pub const ALPN: &[u8] = b"gale";

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// One bidirectional QUIC stream presented as a byte stream; shutdown
/// sends the FIN frame.
pub struct QuicStream {
	send: SendStream,
	recv: RecvStream,
}

impl QuicStream {
	pub fn new(send: SendStream, recv: RecvStream) -> Self {
		QuicStream { send, recv }
	}
}

impl AsyncRead for QuicStream {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
	}
}

impl AsyncWrite for QuicStream {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
	}
}

/// Listener endpoint for `quic+...` inbounds.
pub fn server_endpoint(listen: SocketAddr, identity: TlsIdentity) -> Result<quinn::Endpoint, Error> {
	let mut crypto = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
		.with_no_client_auth()
		.with_single_cert(identity.certs, identity.key)
		.context(TlsConfigSnafu)?;
	crypto.alpn_protocols = vec![ALPN.to_vec()];

	let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
		.map_err(|err| Error::from(io::Error::other(err)))?;
	let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	config.transport_config(Arc::new(transport));

	quinn::Endpoint::server(config, listen).context(BindSocketSnafu { socket_addr: listen })
}

/// Shared outbound QUIC connection for one route. Sessions open bidi
/// streams off a single connection; the first session dials it, a
/// watcher clears the slot when it terminates, and the next session
/// redials. The transport pings every 10 s to keep it alive.
pub struct QuicConnector {
	endpoint:    quinn::Endpoint,
	host:        String,
	port:        u16,
	server_name: String,
	shared:      Arc<tokio::sync::Mutex<Option<quinn::Connection>>>,
}

impl QuicConnector {
	pub fn new(host: &str, port: u16, verify: bool) -> Result<Self, Error> {
		let mut crypto = tls::client_config(verify)?;
		crypto.alpn_protocols = vec![ALPN.to_vec()];
		let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
			.map_err(|err| Error::from(io::Error::other(err)))?;
		let mut config = quinn::ClientConfig::new(Arc::new(crypto));

		let mut transport = TransportConfig::default();
		transport.keep_alive_interval(Some(KEEPALIVE_INTERVAL));
		config.transport_config(Arc::new(transport));

		let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
		let mut endpoint = quinn::Endpoint::client(bind).context(BindSocketSnafu { socket_addr: bind })?;
		endpoint.set_default_client_config(config);

		Ok(QuicConnector {
			endpoint,
			host: host.to_owned(),
			port,
			server_name: host.to_owned(),
			shared: Arc::new(tokio::sync::Mutex::new(None)),
		})
	}

	pub async fn open(&self) -> Result<QuicStream, Error> {
		let connection = {
			let mut guard = self.shared.lock().await;
			match guard.as_ref() {
				Some(connection) if connection.close_reason().is_none() => connection.clone(),
				_ => {
					let connection = self.connect().await?;
					*guard = Some(connection.clone());
					self.watch(connection.clone());
					connection
				}
			}
		};
		let (send, recv) = connection.open_bi().await.context(QuicConnectionSnafu)?;
		Ok(QuicStream::new(send, recv))
	}

	async fn connect(&self) -> Result<quinn::Connection, Error> {
		use snafu::IntoError as _;

		let target = format!("{}:{}", self.host, self.port);
		let Some(addr) = tokio::net::lookup_host((self.host.as_str(), self.port))
			.await
			.context(DialSnafu { target: target.clone() })?
			.next()
		else {
			return Err(DialSnafu { target }.into_error(io::Error::new(io::ErrorKind::NotFound, "no address resolved")));
		};
		debug!(target: "gale_transport::quic", %addr, "dialing shared quic connection");
		let connection = self
			.endpoint
			.connect(addr, &self.server_name)
			.context(QuicConnectSnafu { addr })?
			.await
			.context(QuicConnectionSnafu)?;
		Ok(connection)
	}

	/// Clears the shared slot once this connection terminates, so the
	/// next session dials a fresh one.
	fn watch(&self, connection: quinn::Connection) {
		let shared = self.shared.clone();
		tokio::spawn(async move {
			let reason = connection.closed().await;
			debug!(target: "gale_transport::quic", %reason, "shared quic connection terminated");
			let mut guard = shared.lock().await;
			if guard
				.as_ref()
				.is_some_and(|current| current.stable_id() == connection.stable_id())
			{
				*guard = None;
			}
		});
	}
}
