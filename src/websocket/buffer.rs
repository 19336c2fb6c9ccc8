// src/websocket/buffer.rs

use crate::websocket::frame::{self, Opcode, MAX_HEADER_LEN};

use bytes::{Bytes, BytesMut};

/// One outbound message, framed in place behind a reserved header region.
///
/// The payload is immutable once queued. `bytes_written` only grows, and the
/// buffer is done once every framed byte has been handed to the socket.
#[derive(Debug)]
pub struct SendBuffer {
  storage: BytesMut,
  /// Offset of the first framed byte inside `storage`.
  frame_start: usize,
  payload_len: usize,
  is_binary: bool,
  bytes_written: usize,
}

impl SendBuffer {
  /// Frames `payload` as a single final data frame masked with `mask`.
  pub fn new(payload: &[u8], is_binary: bool, mask: [u8; 4]) -> Self {
    let opcode = if is_binary { Opcode::Binary } else { Opcode::Text };
    Self::with_opcode(payload, opcode, mask)
  }

  pub(crate) fn with_opcode(payload: &[u8], opcode: Opcode, mask: [u8; 4]) -> Self {
    let mut storage = BytesMut::with_capacity(MAX_HEADER_LEN + payload.len());
    storage.resize(MAX_HEADER_LEN, 0);
    storage.extend_from_slice(payload);

    let header = frame::encode_header(opcode, true, payload.len() as u64, Some(mask));
    let frame_start = MAX_HEADER_LEN - header.len();
    storage[frame_start..MAX_HEADER_LEN].copy_from_slice(&header);
    frame::apply_mask(&mut storage[MAX_HEADER_LEN..], mask, 0);

    Self {
      storage,
      frame_start,
      payload_len: payload.len(),
      is_binary: opcode == Opcode::Binary,
      bytes_written: 0,
    }
  }

  pub fn payload_len(&self) -> usize {
    self.payload_len
  }

  pub fn is_binary(&self) -> bool {
    self.is_binary
  }

  /// Header plus payload.
  pub fn frame_len(&self) -> usize {
    self.storage.len() - self.frame_start
  }

  pub fn bytes_written(&self) -> usize {
    self.bytes_written
  }

  /// Framed bytes not yet written.
  pub fn unwritten(&self) -> &[u8] {
    &self.storage[self.frame_start + self.bytes_written..]
  }

  /// Records a (possibly partial) write. Clamped to the frame length.
  pub fn advance(&mut self, written: usize) {
    self.bytes_written = (self.bytes_written + written).min(self.frame_len());
  }

  pub fn is_complete(&self) -> bool {
    self.bytes_written == self.frame_len()
  }
}

/// One inbound chunk as delivered by the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveBuffer {
  pub payload: Bytes,
  /// Bytes still to come in the same frame. Zero completes the frame.
  pub bytes_remaining: usize,
  pub is_binary: bool,
  /// Set on the chunk that ends the final frame of a message.
  pub is_final: bool,
}

impl ReceiveBuffer {
  pub fn new(payload: Bytes, bytes_remaining: usize, is_binary: bool, is_final: bool) -> Self {
    Self {
      payload,
      bytes_remaining,
      is_binary,
      is_final,
    }
  }

  pub fn completes_message(&self) -> bool {
    self.is_final && self.bytes_remaining == 0
  }
}

/// Accumulates chunks until a whole text message is available.
#[derive(Debug, Default)]
pub(crate) struct MessageAssembler {
  pending: BytesMut,
}

impl MessageAssembler {
  /// Appends a chunk; returns the assembled message once `chunk` completes it.
  pub fn push(&mut self, chunk: &ReceiveBuffer) -> Option<Bytes> {
    self.pending.extend_from_slice(&chunk.payload);
    if chunk.completes_message() {
      Some(self.pending.split().freeze())
    } else {
      None
    }
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }
}
