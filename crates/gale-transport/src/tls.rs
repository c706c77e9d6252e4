//! TLS building blocks: PEM loading, the listener-side acceptor and
//! the client config with optional certificate verification.

use std::{path::Path, sync::Arc};

use rustls::{
	ClientConfig, ServerConfig,
	client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
	crypto::CryptoProvider,
	pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};
use snafu::{OptionExt, ResultExt};
use tokio_rustls::TlsAcceptor;

use crate::{EmptyPemSnafu, Error, ReadPemSnafu, TlsConfigSnafu};

/// Certificate chain plus private key for any TLS-carrying listener
/// (tls, wss, quic).
pub struct TlsIdentity {
	pub certs: Vec<CertificateDer<'static>>,
	pub key:   PrivateKeyDer<'static>,
}

impl TlsIdentity {
	pub fn load(cert_chain: &Path, key_file: &Path) -> Result<Self, Error> {
		let certs = load_certs(cert_chain)?;
		let key = load_key(key_file)?;
		Ok(TlsIdentity { certs, key })
	}

	pub fn clone_identity(&self) -> Self {
		TlsIdentity {
			certs: self.certs.clone(),
			key:   self.key.clone_key(),
		}
	}
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
	let pem = std::fs::read(path).context(ReadPemSnafu { path })?;
	let certs = rustls_pemfile::certs(&mut pem.as_slice())
		.collect::<Result<Vec<_>, _>>()
		.context(ReadPemSnafu { path })?;
	snafu::ensure!(!certs.is_empty(), EmptyPemSnafu { path });
	Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
	let pem = std::fs::read(path).context(ReadPemSnafu { path })?;
	rustls_pemfile::private_key(&mut pem.as_slice())
		.context(ReadPemSnafu { path })?
		.context(EmptyPemSnafu { path })
}

pub fn acceptor(identity: TlsIdentity) -> Result<TlsAcceptor, Error> {
	let config = ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(identity.certs, identity.key)
		.context(TlsConfigSnafu)?;
	Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client configuration: platform verification by default, or a
/// verifier that accepts anything when the route opts out with
/// `verify_ssl=false`.
pub fn client_config(verify: bool) -> Result<ClientConfig, Error> {
	if verify {
		use rustls_platform_verifier::BuilderVerifierExt;
		let config = ClientConfig::builder()
			.with_platform_verifier()
			.context(TlsConfigSnafu)?
			.with_no_client_auth();
		Ok(config)
	} else {
		let config = ClientConfig::builder()
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoVerification::new()))
			.with_no_client_auth();
		Ok(config)
	}
}

/// Accepts any server certificate. Selected per route via
/// `verify_ssl=false`, matching the original opt-out.
#[derive(Debug)]
struct NoVerification {
	schemes: Vec<rustls::SignatureScheme>,
}

impl NoVerification {
	fn new() -> Self {
		let schemes = CryptoProvider::get_default()
			.map(|provider| provider.signature_verification_algorithms.supported_schemes())
			.unwrap_or_default();
		NoVerification { schemes }
	}
}

impl ServerCertVerifier for NoVerification {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		self.schemes.clone()
	}
}
