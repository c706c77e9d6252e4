use std::backtrace::Backtrace;

use snafu::Snafu;

pub mod addr;
pub mod aead;
pub mod cipher;
pub mod http;
pub mod parser;
pub mod socks4;
pub mod socks5;
pub mod ss;
pub mod trojan;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtoError {
	#[snafu(display("malformed {what}: {detail}"))]
	Malformed {
		what:      &'static str,
		detail:    String,
		backtrace: Backtrace,
	},
	#[snafu(display("version mismatch, expected {expect} got {current}"))]
	VersionMismatch {
		expect:    u8,
		current:   u8,
		backtrace: Backtrace,
	},
	#[snafu(display("unknown {what} value {value}"))]
	UnknownTag {
		what:      &'static str,
		value:     u8,
		backtrace: Backtrace,
	},
	#[snafu(display("authentication failed"))]
	AuthFailed { backtrace: Backtrace },
	#[snafu(display("{what} is not supported"))]
	NotSupported {
		what:      String,
		backtrace: Backtrace,
	},
	#[snafu(display("peer rejected the request: {detail}"))]
	Rejected {
		detail:    String,
		backtrace: Backtrace,
	},
	#[snafu(display("domain too long: {domain}"))]
	DomainTooLong {
		domain:    String,
		backtrace: Backtrace,
	},
	#[snafu(display("invalid utf-8 in {what}"))]
	BadText {
		what:      &'static str,
		source:    std::str::Utf8Error,
		backtrace: Backtrace,
	},
	#[snafu(display("aead frame of {length} bytes exceeds the limit"))]
	FrameTooLarge {
		length:    usize,
		backtrace: Backtrace,
	},
	#[snafu(display("aead tag verification failed"))]
	Crypto { backtrace: Backtrace },
	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}

impl From<std::io::Error> for ProtoError {
	#[inline]
	fn from(source: std::io::Error) -> Self {
		use snafu::IntoError as _;
		IoSnafu.into_error(source)
	}
}

/// Error for a frame cut short by EOF; codecs return it from
/// `decode_eof` when bytes remain but no full frame does.
pub(crate) fn truncated() -> ProtoError {
	ProtoError::from(std::io::Error::new(
		std::io::ErrorKind::UnexpectedEof,
		"stream ended inside a frame",
	))
}

/// How a server half should turn down a client once the outbound leg
/// is known to be impossible. Protocols without a rejection frame
/// ignore the distinction and just close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Refusal {
	/// Destination denied by policy or credentials.
	NotAllowed,
	HostUnreachable,
	ConnectionRefused,
	General,
}

impl Refusal {
	pub fn from_io(err: &std::io::Error) -> Self {
		match err.kind() {
			std::io::ErrorKind::ConnectionRefused => Refusal::ConnectionRefused,
			std::io::ErrorKind::HostUnreachable
			| std::io::ErrorKind::NetworkUnreachable
			| std::io::ErrorKind::NotFound
			| std::io::ErrorKind::TimedOut => Refusal::HostUnreachable,
			_ => Refusal::General,
		}
	}
}
