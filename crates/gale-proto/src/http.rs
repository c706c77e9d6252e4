//! HTTP CONNECT proxy, server and client halves.
//!
//! Only CONNECT is terminated; plain GET/POST forwarding is rejected.
//! Credentials travel in `Proxy-Authorization: Basic`.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use gale_core::{buffer::StreamBuffer, types::TargetAddr};
use snafu::{OptionExt, ensure};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{AuthFailedSnafu, MalformedSnafu, NotSupportedSnafu, ProtoError, Refusal, RejectedSnafu};

const HEAD_END: &[u8] = b"\r\n\r\n";
const USER_AGENT: &str = "gale";
const AUTH_REALM: &str = "gale";

#[derive(Debug, Clone)]
pub struct RequestHead {
	pub method:  String,
	pub path:    String,
	pub version: String,
	pub headers: Vec<(String, String)>,
}

impl RequestHead {
	pub fn parse(head: &[u8]) -> Result<Self, ProtoError> {
		let text = std::str::from_utf8(head).map_err(|_| malformed("request head", "not valid utf-8"))?;
		let mut lines = text.split("\r\n");
		let request_line = lines.next().context(MalformedSnafu {
			what:   "request head",
			detail: String::from("empty"),
		})?;
		let mut parts = request_line.split_ascii_whitespace();
		let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
			(Some(method), Some(path), Some(version)) => (method, path, version),
			_ => return Err(malformed("request line", request_line)),
		};
		let headers = parse_headers(lines)?;
		Ok(RequestHead {
			method:  method.to_owned(),
			path:    path.to_owned(),
			version: version.to_owned(),
			headers,
		})
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(key, _)| key.eq_ignore_ascii_case(name))
			.map(|(_, value)| value.as_str())
	}
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
	pub version: String,
	pub code:    u16,
	pub reason:  String,
}

impl ResponseHead {
	pub fn parse(head: &[u8]) -> Result<Self, ProtoError> {
		let text = std::str::from_utf8(head).map_err(|_| malformed("response head", "not valid utf-8"))?;
		let status_line = text.split("\r\n").next().unwrap_or_default();
		let mut parts = status_line.splitn(3, ' ');
		let version = parts.next().unwrap_or_default();
		let code = parts
			.next()
			.and_then(|code| code.parse::<u16>().ok())
			.ok_or_else(|| malformed("status line", status_line))?;
		let reason = parts.next().unwrap_or_default();
		Ok(ResponseHead {
			version: version.to_owned(),
			code,
			reason:  reason.to_owned(),
		})
	}
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Vec<(String, String)>, ProtoError> {
	let mut headers = Vec::new();
	for line in lines {
		if line.is_empty() {
			continue;
		}
		let (key, value) = line.split_once(':').ok_or_else(|| malformed("header line", line))?;
		headers.push((key.trim().to_owned(), value.trim().to_owned()));
	}
	Ok(headers)
}

fn malformed(what: &'static str, detail: impl Into<String>) -> ProtoError {
	MalformedSnafu { what, detail: detail.into() }.build()
}

fn basic_auth(username: &str, password: &str) -> String {
	format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
}

pub struct HttpParser {
	credentials: Option<(String, String)>,
}

impl HttpParser {
	pub fn new(credentials: Option<(String, String)>) -> Self {
		HttpParser { credentials }
	}

	pub async fn accept<R, W>(&self, rd: &mut StreamBuffer<R>, wr: &mut W) -> Result<TargetAddr, ProtoError>
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		let head = rd.pull_until(HEAD_END, false).await?;
		let request = RequestHead::parse(&head)?;

		if let Some((username, password)) = &self.credentials {
			let expect = basic_auth(username, password);
			if request.header("Proxy-Authorization") != Some(expect.as_str()) {
				debug!(method = %request.method, "proxy authentication missing or wrong");
				let challenge = format!(
					"{} 407 Proxy Authentication Required\r\n\
					 Connection: close\r\n\
					 Proxy-Authenticate: Basic realm=\"{AUTH_REALM}\"\r\n\r\n",
					request.version,
				);
				wr.write_all(challenge.as_bytes()).await?;
				wr.flush().await?;
				return AuthFailedSnafu.fail();
			}
		}

		ensure!(
			request.method == "CONNECT",
			NotSupportedSnafu {
				what: format!("http method {}", request.method),
			}
		);

		let (host, port) = request
			.path
			.rsplit_once(':')
			.context(MalformedSnafu {
				what:   "connect target",
				detail: request.path.clone(),
			})?;
		let port = port
			.parse::<u16>()
			.map_err(|_| malformed("connect target port", port))?;
		let host = host.trim_start_matches('[').trim_end_matches(']');
		Ok(TargetAddr::from_host_port(host, port))
	}

	pub async fn finish<W>(&self, wr: &mut W) -> Result<(), ProtoError>
	where
		W: AsyncWrite + Unpin,
	{
		wr.write_all(b"HTTP/1.1 200 Connection: Established\r\n\r\n").await?;
		wr.flush().await?;
		Ok(())
	}

	pub async fn refuse<W>(&self, wr: &mut W, _refusal: Refusal) -> Result<(), ProtoError>
	where
		W: AsyncWrite + Unpin,
	{
		wr.write_all(b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n").await?;
		wr.flush().await?;
		Ok(())
	}

	pub async fn connect<R, W>(
		&self,
		rd: &mut StreamBuffer<R>,
		wr: &mut W,
		target: &TargetAddr,
	) -> Result<(), ProtoError>
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		let target = target.to_string();
		let mut request = format!(
			"CONNECT {target} HTTP/1.1\r\n\
			 Host: {target}\r\n\
			 User-Agent: {USER_AGENT}\r\n\
			 Proxy-Connection: Keep-Alive\r\n",
		);
		if let Some((username, password)) = &self.credentials {
			request.push_str(&format!("Proxy-Authorization: {}\r\n", basic_auth(username, password)));
		}
		request.push_str("\r\n");
		wr.write_all(request.as_bytes()).await?;
		wr.flush().await?;

		let head = rd.pull_until(HEAD_END, false).await?;
		let response = ResponseHead::parse(&head)?;
		ensure!(
			response.code == 200,
			RejectedSnafu {
				detail: format!("http status {} {}", response.code, response.reason),
			}
		);
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	/// Scenario: CONNECT with matching Basic credentials (u:p encodes
	/// to `dTpw`).
	#[tokio::test]
	async fn connect_with_auth() -> eyre::Result<()> {
		let wire: &[u8] = b"CONNECT example.com:443 HTTP/1.1\r\nProxy-Authorization: Basic dTpw\r\n\r\n";
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let parser = HttpParser::new(Some((String::from("u"), String::from("p"))));
		let target = parser.accept(&mut rd, &mut wr).await?;
		assert_eq!(target, TargetAddr::from_host_port("example.com", 443));
		assert!(wr.is_empty());

		parser.finish(&mut wr).await?;
		assert_eq!(&wr[..], b"HTTP/1.1 200 Connection: Established\r\n\r\n");
		Ok(())
	}

	#[tokio::test]
	async fn missing_auth_gets_407() -> eyre::Result<()> {
		let wire: &[u8] = b"CONNECT example.com:443 HTTP/1.1\r\n\r\n";
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let parser = HttpParser::new(Some((String::from("u"), String::from("p"))));
		let err = parser.accept(&mut rd, &mut wr).await.unwrap_err();
		assert!(matches!(err, ProtoError::AuthFailed { .. }));
		let reply = String::from_utf8(wr)?;
		assert!(reply.starts_with("HTTP/1.1 407 "));
		assert!(reply.contains("Proxy-Authenticate: Basic realm="));
		Ok(())
	}

	#[tokio::test]
	async fn get_is_rejected() {
		let wire: &[u8] = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let parser = HttpParser::new(None);
		let err = parser.accept(&mut rd, &mut wr).await.unwrap_err();
		assert!(matches!(err, ProtoError::NotSupported { .. }));
	}

	#[tokio::test]
	async fn client_half() -> eyre::Result<()> {
		let wire: &[u8] = b"HTTP/1.1 200 Connection established\r\nServer: upstream\r\n\r\n";
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let parser = HttpParser::new(Some((String::from("u"), String::from("p"))));
		let target = TargetAddr::from_host_port("example.com", 443);
		parser.connect(&mut rd, &mut wr, &target).await?;

		let sent = String::from_utf8(wr)?;
		assert!(sent.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
		assert!(sent.contains("Host: example.com:443\r\n"));
		assert!(sent.contains("Proxy-Connection: Keep-Alive\r\n"));
		assert!(sent.contains("Proxy-Authorization: Basic dTpw\r\n"));
		assert!(sent.ends_with("\r\n\r\n"));
		Ok(())
	}

	#[tokio::test]
	async fn client_rejects_non_200() {
		let wire: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let parser = HttpParser::new(None);
		let target = TargetAddr::from_host_port("example.com", 80);
		let err = parser.connect(&mut rd, &mut wr, &target).await.unwrap_err();
		assert!(matches!(err, ProtoError::Rejected { .. }));
	}

	#[tokio::test]
	async fn ipv6_connect_target() -> eyre::Result<()> {
		let wire: &[u8] = b"CONNECT [::1]:8080 HTTP/1.1\r\n\r\n";
		let mut rd = StreamBuffer::new(wire);
		let mut wr = Vec::new();
		let target = HttpParser::new(None).accept(&mut rd, &mut wr).await?;
		assert_eq!(target, TargetAddr::from_host_port("::1", 8080));
		Ok(())
	}

	#[test]
	fn head_parsing() {
		let head = RequestHead::parse(b"CONNECT a:1 HTTP/1.1\r\nX-One: 1\r\nx-two:  2 ").unwrap();
		assert_eq!(head.header("x-one"), Some("1"));
		assert_eq!(head.header("X-Two"), Some("2"));
		assert!(RequestHead::parse(b"garbage").is_err());
	}
}
