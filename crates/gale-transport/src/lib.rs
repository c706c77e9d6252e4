use std::{backtrace::Backtrace, net::SocketAddr, path::PathBuf};

use snafu::Snafu;

pub mod accept;
pub mod dial;
pub mod quic;
pub mod stream;
pub mod tls;
pub mod ws;

pub use accept::{Acceptor, Pending};
pub use dial::{Outbound, dial_direct};
pub use stream::ProxyStream;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
	#[snafu(display("failed to bind {socket_addr}"))]
	BindSocket {
		socket_addr: SocketAddr,
		source:      std::io::Error,
		backtrace:   Backtrace,
	},
	#[snafu(display("failed to dial {target}"))]
	Dial {
		target:    String,
		source:    std::io::Error,
		backtrace: Backtrace,
	},
	#[snafu(display("cannot read {}", path.display()))]
	ReadPem {
		path:      PathBuf,
		source:    std::io::Error,
		backtrace: Backtrace,
	},
	#[snafu(display("no certificate or key found in {}", path.display()))]
	EmptyPem { path: PathBuf, backtrace: Backtrace },
	#[snafu(display("tls setup failed"))]
	TlsConfig {
		source:    rustls::Error,
		backtrace: Backtrace,
	},
	#[snafu(display("invalid tls server name {name}"))]
	ServerName { name: String, backtrace: Backtrace },
	#[snafu(display("quic connect to {addr} failed"))]
	QuicConnect {
		addr:      SocketAddr,
		source:    quinn::ConnectError,
		backtrace: Backtrace,
	},
	QuicConnection {
		source:    quinn::ConnectionError,
		backtrace: Backtrace,
	},
	#[snafu(display("websocket handshake failed"))]
	WsHandshake {
		source:    Box<tokio_tungstenite::tungstenite::Error>,
		backtrace: Backtrace,
	},
	#[snafu(display("listener channel closed"))]
	ListenerClosed { backtrace: Backtrace },
	#[snafu(display("{transport} listener requires a certificate chain and key"))]
	MissingIdentity {
		transport: &'static str,
		backtrace: Backtrace,
	},
	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}

impl From<std::io::Error> for Error {
	#[inline]
	fn from(source: std::io::Error) -> Self {
		use snafu::IntoError as _;
		IoSnafu.into_error(source)
	}
}

/// Installs the process-wide rustls crypto provider. Safe to call more
/// than once; later calls are no-ops.
pub fn init_crypto() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
