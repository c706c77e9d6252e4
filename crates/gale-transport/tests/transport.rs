//! Round-trip tests for each transport adapter: the same bytes must
//! come out of the far side regardless of the carrier.

use std::sync::Arc;

use gale_core::{policy::DestPolicy, url::RouteSpec};
use gale_transport::{Acceptor, Outbound, dial_direct, init_crypto, tls::TlsIdentity};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn self_signed() -> TlsIdentity {
	let cert = rcgen::generate_simple_self_signed(vec![String::from("localhost")]).unwrap();
	TlsIdentity {
		certs: vec![CertificateDer::from(cert.cert)],
		key:   PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der())),
	}
}

fn spec(url: &str) -> RouteSpec {
	url.parse().unwrap()
}

/// Binds `listen_url` on port 0, dials it through `Outbound` with the
/// bound port patched in, then echoes one payload both ways.
async fn echo_once(listen_url: &str, identity: Option<TlsIdentity>) -> eyre::Result<()> {
	init_crypto();
	let policy = Arc::new(DestPolicy::default());
	let mut acceptor = Acceptor::bind(&spec(listen_url), identity, policy).await?;
	let port = acceptor.local_addr().port();

	let server = tokio::spawn(async move {
		let (pending, _peer) = acceptor.accept().await?;
		let mut stream = pending.establish().await?;
		let mut buf = [0u8; 5];
		stream.read_exact(&mut buf).await?;
		stream.write_all(&buf).await?;
		stream.flush().await?;
		eyre::Ok(())
	});

	let mut dial_spec = spec(listen_url);
	dial_spec.port = port;
	dial_spec.verify_ssl = false;

	let outbound = Outbound::new(dial_spec)?;
	let mut stream = outbound.dial().await?;
	stream.write_all(b"hello").await?;
	stream.flush().await?;
	let mut buf = [0u8; 5];
	stream.read_exact(&mut buf).await?;
	assert_eq!(&buf, b"hello");

	server.await??;
	Ok(())
}

#[tokio::test]
async fn tcp_round_trip() -> eyre::Result<()> {
	echo_once("tcp+plain://127.0.0.1:0", None).await
}

#[tokio::test]
async fn tls_round_trip() -> eyre::Result<()> {
	echo_once("tls+plain://127.0.0.1:0", Some(self_signed())).await
}

#[tokio::test]
async fn ws_round_trip() -> eyre::Result<()> {
	echo_once("ws+plain://127.0.0.1:0", None).await
}

#[tokio::test]
async fn wss_round_trip() -> eyre::Result<()> {
	echo_once("wss+plain://127.0.0.1:0", Some(self_signed())).await
}

#[tokio::test]
async fn quic_round_trip() -> eyre::Result<()> {
	echo_once("quic+plain://127.0.0.1:0", Some(self_signed())).await
}

/// Two QUIC dials off one outbound must not require a second
/// connection handshake; the second stream opens on the shared
/// connection that the first dial established.
#[tokio::test]
async fn quic_streams_share_one_connection() -> eyre::Result<()> {
	init_crypto();
	let policy = Arc::new(DestPolicy::default());
	let mut acceptor = Acceptor::bind(&spec("quic+plain://127.0.0.1:0"), Some(self_signed()), policy).await?;
	let port = acceptor.local_addr().port();

	let server = tokio::spawn(async move {
		for _ in 0..2 {
			let (pending, _peer) = acceptor.accept().await?;
			tokio::spawn(async move {
				let mut stream = pending.establish().await?;
				let mut buf = [0u8; 4];
				stream.read_exact(&mut buf).await?;
				stream.write_all(&buf).await?;
				stream.flush().await?;
				eyre::Ok(())
			});
		}
		eyre::Ok(())
	});

	let mut dial_spec = spec("quic+plain://127.0.0.1:0");
	dial_spec.port = port;
	dial_spec.verify_ssl = false;
	let outbound = Outbound::new(dial_spec)?;

	for _ in 0..2 {
		let mut stream = outbound.dial().await?;
		stream.write_all(b"ping").await?;
		stream.flush().await?;
		let mut buf = [0u8; 4];
		stream.read_exact(&mut buf).await?;
		assert_eq!(&buf, b"ping");
	}

	server.await??;
	Ok(())
}

#[tokio::test]
async fn direct_dial_and_refusal() -> eyre::Result<()> {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
	let addr = listener.local_addr()?;
	let target = gale_core::types::TargetAddr::from_host_port("127.0.0.1", addr.port());

	let accept = tokio::spawn(async move { listener.accept().await });
	let stream = dial_direct(&target).await?;
	drop(stream);
	accept.await??;

	// A port nothing listens on must surface a dial error (after the
	// built-in retry).
	let dead = gale_core::types::TargetAddr::from_host_port("127.0.0.1", 1);
	assert!(dial_direct(&dead).await.is_err());
	Ok(())
}
