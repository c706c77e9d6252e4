//! `AeadStream` frames a byte stream into Shadowsocks AEAD records.
//!
//! The write side lazily emits its 32-byte salt ahead of the first
//! sealed frame; the read side pulls the peer's salt and then walks a
//! Salt -> Length -> Payload state machine. Staging is bounded to one
//! frame, so stalled readers propagate backpressure to the transport.

use std::{
	io,
	pin::Pin,
	task::{Context, Poll},
};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::cipher::{Cipher, OpenKey, SALT_SIZE, SealKey, TAG_SIZE};

#[derive(Clone, Copy)]
enum ReadState {
	Salt { filled: usize },
	Length { filled: usize },
	Payload { filled: usize },
}

enum WriteState {
	Ready,
	// Ciphertext for one accepted chunk, partially written to the
	// transport.
	Flushing { data: Vec<u8>, written: usize, taken: usize },
}

pub struct AeadStream<S> {
	inner:       S,
	cipher:      Cipher,
	seal:        Option<SealKey>,
	open:        Option<OpenKey>,
	read_state:  ReadState,
	// Incoming ciphertext staging for the state the reader is in.
	crypt_buf:   Vec<u8>,
	// Decrypted bytes not yet handed to the caller.
	plain:       BytesMut,
	write_state: WriteState,
}

fn crypto_err(err: crate::ProtoError) -> io::Error {
	io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

impl<S> AeadStream<S> {
	pub fn new(inner: S, cipher: Cipher) -> Self {
		AeadStream {
			inner,
			cipher,
			seal: None,
			open: None,
			read_state: ReadState::Salt { filled: 0 },
			crypt_buf: vec![0u8; SALT_SIZE],
			plain: BytesMut::new(),
			write_state: WriteState::Ready,
		}
	}
}

impl<S: AsyncRead + Unpin> AeadStream<S> {
	/// Fills `crypt_buf[*filled..]` from the transport. Returns the
	/// new fill level, or 0 total bytes meaning EOF before any byte of
	/// this element arrived.
	fn poll_fill_crypt(&mut self, cx: &mut Context<'_>, filled: &mut usize) -> Poll<io::Result<bool>> {
		while *filled < self.crypt_buf.len() {
			let mut read_buf = ReadBuf::new(&mut self.crypt_buf[*filled..]);
			match Pin::new(&mut self.inner).poll_read(cx, &mut read_buf) {
				Poll::Ready(Ok(())) => {
					let num = read_buf.filled().len();
					if num == 0 {
						return Poll::Ready(Ok(*filled == 0));
					}
					*filled += num;
				}
				Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
				Poll::Pending => return Poll::Pending,
			}
		}
		Poll::Ready(Ok(false))
	}
}

impl<S: AsyncRead + Unpin> AsyncRead for AeadStream<S> {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();

		loop {
			if !this.plain.is_empty() {
				let num = this.plain.len().min(buf.remaining());
				buf.put_slice(&this.plain.split_to(num));
				return Poll::Ready(Ok(()));
			}

			match this.read_state {
				ReadState::Salt { mut filled } => {
					let clean_eof = match this.poll_fill_crypt(cx, &mut filled) {
						Poll::Ready(Ok(clean)) => clean,
						Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
						Poll::Pending => {
							this.read_state = ReadState::Salt { filled };
							return Poll::Pending;
						}
					};
					if filled < SALT_SIZE {
						// EOF with no salt at all is a peer that never
						// spoke; EOF inside the salt is a cut stream.
						return if clean_eof {
							Poll::Ready(Ok(()))
						} else {
							Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()))
						};
					}
					this.open = Some(this.cipher.opener(&this.crypt_buf));
					this.crypt_buf = vec![0u8; 2 + TAG_SIZE];
					this.read_state = ReadState::Length { filled: 0 };
				}
				ReadState::Length { mut filled } => {
					let clean_eof = match this.poll_fill_crypt(cx, &mut filled) {
						Poll::Ready(Ok(clean)) => clean,
						Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
						Poll::Pending => {
							this.read_state = ReadState::Length { filled };
							return Poll::Pending;
						}
					};
					if filled < 2 + TAG_SIZE {
						// A frame boundary is the only clean EOF point.
						return if clean_eof {
							Poll::Ready(Ok(()))
						} else {
							Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()))
						};
					}
					let open = match this.open.as_mut() {
						Some(open) => open,
						None => unreachable!("opener exists after the salt state"),
					};
					let length = open.open_length(&this.crypt_buf).map_err(crypto_err)?;
					this.crypt_buf = vec![0u8; length + TAG_SIZE];
					this.read_state = ReadState::Payload { filled: 0 };
				}
				ReadState::Payload { mut filled } => {
					match this.poll_fill_crypt(cx, &mut filled) {
						Poll::Ready(Ok(_)) => {}
						Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
						Poll::Pending => {
							this.read_state = ReadState::Payload { filled };
							return Poll::Pending;
						}
					}
					if filled < this.crypt_buf.len() {
						// The length frame promised payload bytes.
						return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
					}
					let open = match this.open.as_mut() {
						Some(open) => open,
						None => unreachable!("opener exists after the salt state"),
					};
					let plain = open.open_chunk(&this.crypt_buf).map_err(crypto_err)?;
					this.plain.extend_from_slice(&plain);
					this.crypt_buf = vec![0u8; 2 + TAG_SIZE];
					this.read_state = ReadState::Length { filled: 0 };
				}
			}
		}
	}
}

impl<S: AsyncWrite + Unpin> AeadStream<S> {
	fn poll_flush_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		if let WriteState::Flushing { data, written, .. } = &mut self.write_state {
			while *written < data.len() {
				match Pin::new(&mut self.inner).poll_write(cx, &data[*written..]) {
					Poll::Ready(Ok(0)) => {
						return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
					}
					Poll::Ready(Ok(num)) => *written += num,
					Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
					Poll::Pending => return Poll::Pending,
				}
			}
		}
		Poll::Ready(Ok(()))
	}
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AeadStream<S> {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		let this = self.get_mut();

		loop {
			match &mut this.write_state {
				WriteState::Ready => {
					if buf.is_empty() {
						return Poll::Ready(Ok(0));
					}
					let mut data = Vec::new();
					if this.seal.is_none() {
						let salt = Cipher::random_salt();
						data.extend_from_slice(&salt);
						this.seal = Some(this.cipher.sealer(&salt));
					}
					let seal = match this.seal.as_mut() {
						Some(seal) => seal,
						None => unreachable!("installed above"),
					};
					seal.seal_frame(buf, &mut data).map_err(crypto_err)?;
					this.write_state = WriteState::Flushing {
						data,
						written: 0,
						taken: buf.len(),
					};
				}
				WriteState::Flushing { taken, .. } => {
					let taken = *taken;
					match this.poll_flush_pending(cx) {
						Poll::Ready(Ok(())) => {
							this.write_state = WriteState::Ready;
							return Poll::Ready(Ok(taken));
						}
						Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
						Poll::Pending => return Poll::Pending,
					}
				}
			}
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		match this.poll_flush_pending(cx) {
			Poll::Ready(Ok(())) => {
				this.write_state = WriteState::Ready;
				Pin::new(&mut this.inner).poll_flush(cx)
			}
			other => other,
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		match this.poll_flush_pending(cx) {
			Poll::Ready(Ok(())) => {
				this.write_state = WriteState::Ready;
				Pin::new(&mut this.inner).poll_shutdown(cx)
			}
			other => other,
		}
	}
}
