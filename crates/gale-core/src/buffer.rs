//! Buffered pull-oriented reader backing every protocol parser.
//!
//! All handshake parsing is written against this type, so the same
//! state machines run unchanged whether the bytes arrive from a TCP
//! socket, a TLS record layer, a QUIC stream or reassembled WebSocket
//! frames.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::Decoder;

pub struct StreamBuffer<R> {
	io:       R,
	buf:      BytesMut,
	eof:      bool,
	// Where the previous unfinished delimiter search stopped, so
	// repeated `pull_until` calls stay linear in the total bytes seen.
	scan_pos: usize,
}

fn unexpected_eof(needed: usize, available: usize) -> io::Error {
	io::Error::new(
		io::ErrorKind::UnexpectedEof,
		format!("stream ended, needed {needed} bytes but only {available} arrived"),
	)
}

fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
	if needle.is_empty() || haystack.len() < needle.len() {
		return None;
	}
	haystack[from..]
		.windows(needle.len())
		.position(|window| window == needle)
		.map(|idx| idx + from)
}

impl<R: AsyncRead + Unpin> StreamBuffer<R> {
	pub fn new(io: R) -> Self {
		StreamBuffer {
			io,
			buf: BytesMut::with_capacity(8 * 1024),
			eof: false,
			scan_pos: 0,
		}
	}

	pub fn len(&self) -> usize {
		self.buf.len()
	}

	pub fn is_empty(&self) -> bool {
		self.buf.is_empty()
	}

	pub fn get_mut(&mut self) -> &mut R {
		&mut self.io
	}

	async fn fill(&mut self) -> io::Result<usize> {
		if self.eof {
			return Ok(0);
		}
		let num = self.io.read_buf(&mut self.buf).await?;
		if num == 0 {
			self.eof = true;
		}
		Ok(num)
	}

	/// Suspends until `nbytes` are available, consumes and returns
	/// exactly that many.
	pub async fn pull_exact(&mut self, nbytes: usize) -> io::Result<Bytes> {
		while self.buf.len() < nbytes {
			if self.fill().await? == 0 {
				return Err(unexpected_eof(nbytes, self.buf.len()));
			}
		}
		self.scan_pos = 0;
		Ok(self.buf.split_to(nbytes).freeze())
	}

	pub async fn pull_u8(&mut self) -> io::Result<u8> {
		Ok(self.pull_exact(1).await?[0])
	}

	pub async fn pull_u16be(&mut self) -> io::Result<u16> {
		let bytes = self.pull_exact(2).await?;
		Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
	}

	/// Suspends until `delim` appears, consumes through it and returns
	/// the data before it, with the delimiter appended when
	/// `keep_delim` is set.
	pub async fn pull_until(&mut self, delim: &[u8], keep_delim: bool) -> io::Result<Bytes> {
		loop {
			let from = self.scan_pos.min(self.buf.len());
			if let Some(idx) = find_from(&self.buf, delim, from) {
				let mut chunk = self.buf.split_to(idx + delim.len());
				self.scan_pos = 0;
				if !keep_delim {
					chunk.truncate(idx);
				}
				return Ok(chunk.freeze());
			}
			self.scan_pos = self.buf.len().saturating_sub(delim.len() - 1);
			if self.fill().await? == 0 {
				return Err(unexpected_eof(self.buf.len() + delim.len(), self.buf.len()));
			}
		}
	}

	/// Suspends until `nbytes` are available and returns them without
	/// consuming.
	pub async fn peek(&mut self, nbytes: usize) -> io::Result<&[u8]> {
		while self.buf.len() < nbytes {
			if self.fill().await? == 0 {
				return Err(unexpected_eof(nbytes, self.buf.len()));
			}
		}
		Ok(&self.buf[..nbytes])
	}

	/// Opportunistic read: yields up to `nbytes` as soon as anything is
	/// available, or an empty chunk at EOF.
	pub async fn read(&mut self, nbytes: usize) -> io::Result<Bytes> {
		if self.buf.is_empty() && self.fill().await? == 0 {
			return Ok(Bytes::new());
		}
		self.scan_pos = 0;
		let take = nbytes.min(self.buf.len());
		Ok(self.buf.split_to(take).freeze())
	}

	/// Drains whatever is currently buffered without suspending.
	pub fn read_all(&mut self) -> Bytes {
		self.scan_pos = 0;
		self.buf.split().freeze()
	}

	/// Drives a frame decoder against the buffer until it produces an
	/// item: a partial decode reads more from the transport, EOF inside
	/// a frame surfaces as `UnexpectedEof`.
	pub async fn pull<C>(&mut self, codec: &mut C) -> Result<C::Item, C::Error>
	where
		C: Decoder,
	{
		loop {
			if let Some(item) = codec.decode(&mut self.buf)? {
				self.scan_pos = 0;
				return Ok(item);
			}
			if self.fill().await.map_err(C::Error::from)? == 0 {
				self.scan_pos = 0;
				return match codec.decode_eof(&mut self.buf)? {
					Some(item) => Ok(item),
					None => Err(C::Error::from(unexpected_eof(self.buf.len() + 1, self.buf.len()))),
				};
			}
		}
	}
}
