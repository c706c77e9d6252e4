//! The duplex relay coupling two half-connections.

use std::{
	io,
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::{buffer::StreamBuffer, throttle::Throttle};

const RELAY_CHUNK: usize = 4096;

/// One relay direction: moves bytes from `src` (draining any handshake
/// leftovers buffered there first) into `dst` until EOF or error.
///
/// EOF is forwarded as a shutdown only when the peer transport supports
/// half-close; a WebSocket peer gets closed by `couple` instead.
pub async fn pipe<R, W>(
	src: &mut StreamBuffer<R>,
	dst: &mut W,
	throttle: Option<Arc<Throttle>>,
	half_close: bool,
	moved: &AtomicU64,
) -> io::Result<()>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	loop {
		let chunk = src.read(RELAY_CHUNK).await?;
		if chunk.is_empty() {
			if half_close {
				let _ = dst.shutdown().await;
			}
			return Ok(());
		}
		if let Some(throttle) = &throttle {
			throttle.consume(chunk.len() as u64).await;
		}
		moved.fetch_add(chunk.len() as u64, Ordering::Relaxed);
		dst.write_all(&chunk).await?;
		dst.flush().await?;
	}
}

/// Couples the inbound and outbound halves of a session: upload
/// (inbound -> outbound, gated by `up`) races download (outbound ->
/// inbound, gated by `down`); whichever direction finishes first tears
/// the whole session down.
///
/// Returns `(uploaded, downloaded, error)`.
pub async fn couple<RA, WA, RB, WB>(
	mut inbound_rd: StreamBuffer<RA>,
	mut inbound_wr: WA,
	mut outbound_rd: StreamBuffer<RB>,
	mut outbound_wr: WB,
	up: Option<Arc<Throttle>>,
	down: Option<Arc<Throttle>>,
	inbound_half_close: bool,
	outbound_half_close: bool,
) -> (u64, u64, Option<io::Error>)
where
	RA: AsyncRead + Unpin,
	WA: AsyncWrite + Unpin,
	RB: AsyncRead + Unpin,
	WB: AsyncWrite + Unpin,
{
	let uploaded = AtomicU64::new(0);
	let downloaded = AtomicU64::new(0);

	let result = {
		let upload = pipe(&mut inbound_rd, &mut outbound_wr, up, outbound_half_close, &uploaded);
		let download = pipe(&mut outbound_rd, &mut inbound_wr, down, inbound_half_close, &downloaded);
		tokio::pin!(upload);
		tokio::pin!(download);
		tokio::select! {
			res = &mut upload => {
				trace!("upload direction finished first");
				res
			}
			res = &mut download => {
				trace!("download direction finished first");
				res
			}
		}
	};

	// Either direction ending ends the session: close both writers so
	// the sibling direction cannot outlive it.
	let _ = inbound_wr.shutdown().await;
	let _ = outbound_wr.shutdown().await;

	(
		uploaded.load(Ordering::Relaxed),
		downloaded.load(Ordering::Relaxed),
		result.err(),
	)
}

#[cfg(test)]
mod test {
	use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

	use super::*;

	#[tokio::test]
	async fn couple_moves_both_directions() {
		let (client, client_far) = duplex(1024);
		let (server, server_far) = duplex(1024);

		let relay = tokio::spawn(async move {
			let (cr, cw) = tokio::io::split(client_far);
			let (sr, sw) = tokio::io::split(server_far);
			couple(
				StreamBuffer::new(cr),
				cw,
				StreamBuffer::new(sr),
				sw,
				None,
				None,
				true,
				true,
			)
			.await
		});

		let (mut client_rd, mut client_wr) = tokio::io::split(client);
		let (mut server_rd, mut server_wr) = tokio::io::split(server);

		client_wr.write_all(b"ping").await.unwrap();
		let mut got = [0u8; 4];
		server_rd.read_exact(&mut got).await.unwrap();
		assert_eq!(&got, b"ping");

		server_wr.write_all(b"pong!").await.unwrap();
		let mut got = [0u8; 5];
		client_rd.read_exact(&mut got).await.unwrap();
		assert_eq!(&got, b"pong!");

		// Client closes; the relay must terminate and close the server
		// side too.
		client_wr.shutdown().await.unwrap();
		let (up, down, err) = relay.await.unwrap();
		assert_eq!(up, 4);
		assert_eq!(down, 5);
		assert!(err.is_none());
		assert_eq!(server_rd.read(&mut [0u8; 8]).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn pipe_drains_buffered_leftovers() {
		let leftovers: &[u8] = b"already-buffered";
		let mut src = StreamBuffer::new(leftovers);
		// Pre-buffer by peeking everything before relaying.
		src.peek(8).await.unwrap();

		let (mut near, far) = duplex(64);
		let mut far = far;
		let moved = AtomicU64::new(0);
		let task = tokio::spawn(async move {
			let mut got = Vec::new();
			tokio::io::AsyncReadExt::read_to_end(&mut near, &mut got).await.unwrap();
			got
		});
		pipe(&mut src, &mut far, None, true, &moved).await.unwrap();
		drop(far);
		assert_eq!(task.await.unwrap(), leftovers);
		assert_eq!(moved.load(Ordering::Relaxed), leftovers.len() as u64);
	}
}
