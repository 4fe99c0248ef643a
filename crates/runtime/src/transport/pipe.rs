//! Length-prefixed packet framing over a byte stream.
//!
//! Used for worker processes, where the only channel is a pair of stdio pipes.
//! Buffers cannot be handed over, so they are disassembled into offset/length
//! spans plus one backing block appended to the frame:
//!
//! ```text
//! [frame len: u32 LE][header len: u32 LE][header JSON][backing block]
//! ```
//!
//! The header holds the message, the channel token and the buffer spans. On
//! receipt each buffer is a slice of the shared backing block, so reassembly
//! costs no further copies.
//!
//! A frame longer than the configured maximum, or one whose header cannot be
//! read, ends the read loop with [`Error::Protocol`]: the stream can no longer
//! be trusted, so the connection closes. A readable header with bad buffer
//! spans only fails that message; a response is delivered as a protocol error
//! for its call.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sqlview_protocol::{ChannelToken, Message, Packet, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::{BoxFuture, Transport, TransportParts, TransportReceiver};
use crate::error::{Error, Result};

/// Largest frame a pipe accepts unless told otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 30;

/// Room for the header and framing on top of a frame's buffers.
pub const FRAME_OVERHEAD: usize = 1 << 20;

/// Frame limit for a pipe whose largest payload is `max_payload` bytes.
///
/// A frame may carry a database and its WAL side by side, so the limit
/// leaves room for two payloads plus the header.
pub fn frame_limit_for(max_payload: u64) -> usize {
	let limit = max_payload.saturating_mul(2).saturating_add(FRAME_OVERHEAD as u64);
	usize::try_from(limit).unwrap_or(usize::MAX)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BufferSpan {
	offset: u64,
	length: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	channel: Option<ChannelToken>,
	message: Message,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	buffers: Vec<BufferSpan>,
}

/// Pipe transport before it is split into halves.
pub struct PipeTransport<W, R> {
	stdin: W,
	stdout: R,
	message_tx: mpsc::UnboundedSender<Packet>,
	max_frame_len: usize,
}

impl<W, R> PipeTransport<W, R>
where
	W: AsyncWrite + Unpin + Send + 'static,
	R: AsyncRead + Unpin + Send + 'static,
{
	/// Creates a transport writing to `stdin` and reading from `stdout`.
	///
	/// Returns the transport and the receiver decoded packets are delivered to.
	pub fn new(stdin: W, stdout: R) -> (Self, mpsc::UnboundedReceiver<Packet>) {
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		(
			Self {
				stdin,
				stdout,
				message_tx,
				max_frame_len: DEFAULT_MAX_FRAME_LEN,
			},
			message_rx,
		)
	}

	/// Caps incoming frames at `max_frame_len` bytes.
	pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
		self.max_frame_len = max_frame_len;
		self
	}

	pub fn into_parts(self) -> (PipeTransportSender<W>, PipeTransportReceiver<R>) {
		(
			PipeTransportSender { stdin: self.stdin },
			PipeTransportReceiver {
				stdout: self.stdout,
				message_tx: self.message_tx,
				max_frame_len: self.max_frame_len,
			},
		)
	}

	pub fn into_transport_parts(self, message_rx: mpsc::UnboundedReceiver<Packet>) -> TransportParts {
		let (sender, receiver) = self.into_parts();
		TransportParts {
			sender: Box::new(sender),
			receiver: Box::new(receiver),
			message_rx,
		}
	}

	/// Reads frames until end of stream without splitting the transport.
	pub async fn run(&mut self) -> Result<()> {
		read_loop(&mut self.stdout, &self.message_tx, self.max_frame_len).await
	}
}

/// Writing half of a pipe transport.
pub struct PipeTransportSender<W> {
	stdin: W,
}

impl<W: AsyncWrite + Unpin + Send> PipeTransportSender<W> {
	pub async fn send(&mut self, packet: Packet) -> Result<()> {
		write_packet(&mut self.stdin, packet).await
	}
}

impl<W: AsyncWrite + Unpin + Send> Transport for PipeTransportSender<W> {
	fn send(&mut self, packet: Packet) -> BoxFuture<'_, Result<()>> {
		Box::pin(write_packet(&mut self.stdin, packet))
	}
}

/// Reading half of a pipe transport.
pub struct PipeTransportReceiver<R> {
	stdout: R,
	message_tx: mpsc::UnboundedSender<Packet>,
	max_frame_len: usize,
}

impl<R: AsyncRead + Unpin + Send + 'static> TransportReceiver for PipeTransportReceiver<R> {
	fn run(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
		let PipeTransportReceiver {
			mut stdout,
			message_tx,
			max_frame_len,
		} = *self;
		Box::pin(async move { read_loop(&mut stdout, &message_tx, max_frame_len).await })
	}
}

async fn read_loop<R: AsyncRead + Unpin>(
	stdout: &mut R,
	message_tx: &mpsc::UnboundedSender<Packet>,
	max_frame_len: usize,
) -> Result<()> {
	loop {
		let Some(frame) = read_frame(stdout, max_frame_len).await? else {
			trace!(target = "sqlview.transport", "pipe reached end of stream");
			return Ok(());
		};

		if message_tx.send(decode_frame(frame)?).is_err() {
			// Connection dropped its receiver; nothing left to deliver to.
			return Ok(());
		}
	}
}

async fn read_frame<R: AsyncRead + Unpin>(stdout: &mut R, max_frame_len: usize) -> Result<Option<Bytes>> {
	let mut len_buf = [0u8; 4];
	let mut filled = 0;
	while filled < len_buf.len() {
		let n = stdout
			.read(&mut len_buf[filled..])
			.await
			.map_err(|e| Error::Transport(format!("Failed to read length prefix: {e}")))?;
		if n == 0 {
			if filled == 0 {
				return Ok(None);
			}
			return Err(Error::Transport(
				"Failed to read length prefix: stream ended mid-prefix".to_string(),
			));
		}
		filled += n;
	}

	let frame_len = u32::from_le_bytes(len_buf) as usize;
	if frame_len > max_frame_len {
		return Err(Error::Protocol(format!(
			"frame of {frame_len} bytes exceeds the {max_frame_len} byte limit"
		)));
	}
	let mut frame = BytesMut::zeroed(frame_len);
	stdout
		.read_exact(&mut frame)
		.await
		.map_err(|e| Error::Transport(format!("Failed to read frame body ({frame_len} bytes): {e}")))?;

	Ok(Some(frame.freeze()))
}

fn decode_frame(frame: Bytes) -> Result<Packet> {
	if frame.len() < 4 {
		return Err(Error::Protocol(format!("frame of {} bytes has no header length", frame.len())));
	}
	let header_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
	let header_end = 4usize
		.checked_add(header_len)
		.filter(|end| *end <= frame.len())
		.ok_or_else(|| Error::Protocol(format!("header length {header_len} exceeds frame")))?;

	let header: FrameHeader = serde_json::from_slice(&frame[4..header_end])
		.map_err(|e| Error::Protocol(format!("malformed frame header: {e}")))?;

	let block = frame.slice(header_end..);
	let buffers = header
		.buffers
		.iter()
		.map(|span| {
			let start = usize::try_from(span.offset).ok()?;
			let end = start.checked_add(usize::try_from(span.length).ok()?)?;
			(end <= block.len()).then(|| block.slice(start..end))
		})
		.collect::<Option<Vec<_>>>();

	let Some(buffers) = buffers else {
		return Ok(unresolvable_buffers(header, block.len()));
	};
	Ok(Packet {
		channel: header.channel,
		message: header.message,
		buffers,
	})
}

/// Packet delivered for a readable header whose buffer spans fall outside the block.
///
/// A response becomes a protocol error for its call. Other messages arrive
/// without buffers, so any buffer reference in them fails on lookup.
fn unresolvable_buffers(header: FrameHeader, block_len: usize) -> Packet {
	let err = Error::Protocol(format!(
		"{} buffer spans {:?} exceed the {block_len} byte backing block",
		header.message.kind(),
		header.buffers
	));
	warn!(target = "sqlview.transport", error = %err, "frame with unresolvable buffers");

	let message = match header.message {
		Message::Response(response) => Message::Response(Response::err(response.id, err.to_payload())),
		other => other,
	};
	Packet {
		channel: header.channel,
		message,
		buffers: Vec::new(),
	}
}

async fn write_packet<W: AsyncWrite + Unpin>(stdin: &mut W, packet: Packet) -> Result<()> {
	let Packet {
		channel,
		message,
		buffers,
	} = packet;

	let mut offset = 0u64;
	let spans = buffers
		.iter()
		.map(|buffer| {
			let span = BufferSpan {
				offset,
				length: buffer.len() as u64,
			};
			offset += span.length;
			span
		})
		.collect();

	let header = serde_json::to_vec(&FrameHeader {
		channel,
		message,
		buffers: spans,
	})?;

	let body_len = 4 + header.len() as u64 + offset;
	let frame_len = u32::try_from(body_len)
		.map_err(|_| Error::Transport(format!("frame of {body_len} bytes exceeds the u32 length prefix")))?;

	stdin.write_all(&frame_len.to_le_bytes()).await?;
	stdin.write_all(&(header.len() as u32).to_le_bytes()).await?;
	stdin.write_all(&header).await?;
	for buffer in &buffers {
		stdin.write_all(buffer).await?;
	}
	stdin.flush().await?;

	Ok(())
}
