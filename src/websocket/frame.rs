// src/websocket/frame.rs

//! RFC 6455 framing: header encoding for outbound frames and an incremental
//! decoder that surfaces inbound payload as it arrives.

use crate::error::TransportError;

use bytes::{Buf, Bytes, BytesMut};

// --- Header Layout ---
pub const FIN_BIT: u8 = 0b1000_0000;
pub const RSV_MASK: u8 = 0b0111_0000;
pub const OPCODE_MASK: u8 = 0b0000_1111;
pub const MASK_BIT: u8 = 0b1000_0000;
pub const LEN_MASK: u8 = 0b0111_1111;
pub const LEN_16: u8 = 126;
pub const LEN_64: u8 = 127;
/// 2 fixed bytes + 8 extended length bytes + 4 mask bytes.
pub const MAX_HEADER_LEN: usize = 14;
pub const MAX_CONTROL_PAYLOAD: usize = 125;

// --- Close Codes ---
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_TOO_BIG: u16 = 1009;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
  Continuation,
  Text,
  Binary,
  Close,
  Ping,
  Pong,
}

impl Opcode {
  pub fn from_u8(value: u8) -> Option<Self> {
    match value {
      0x0 => Some(Opcode::Continuation),
      0x1 => Some(Opcode::Text),
      0x2 => Some(Opcode::Binary),
      0x8 => Some(Opcode::Close),
      0x9 => Some(Opcode::Ping),
      0xA => Some(Opcode::Pong),
      _ => None,
    }
  }

  pub fn as_u8(self) -> u8 {
    match self {
      Opcode::Continuation => 0x0,
      Opcode::Text => 0x1,
      Opcode::Binary => 0x2,
      Opcode::Close => 0x8,
      Opcode::Ping => 0x9,
      Opcode::Pong => 0xA,
    }
  }

  pub fn is_control(self) -> bool {
    matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
  }
}

/// Encodes a frame header. With a mask the key is appended after the length.
pub fn encode_header(opcode: Opcode, fin: bool, payload_len: u64, mask: Option<[u8; 4]>) -> Vec<u8> {
  let mut header = Vec::with_capacity(MAX_HEADER_LEN);
  let first = if fin { FIN_BIT } else { 0 } | opcode.as_u8();
  header.push(first);
  let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
  if payload_len < LEN_16 as u64 {
    header.push(mask_bit | payload_len as u8);
  } else if payload_len <= u16::MAX as u64 {
    header.push(mask_bit | LEN_16);
    header.extend_from_slice(&(payload_len as u16).to_be_bytes());
  } else {
    header.push(mask_bit | LEN_64);
    header.extend_from_slice(&payload_len.to_be_bytes());
  }
  if let Some(key) = mask {
    header.extend_from_slice(&key);
  }
  header
}

/// XORs `data` with `mask`, starting at byte `offset` of the frame payload.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4], offset: usize) {
  for (i, byte) in data.iter_mut().enumerate() {
    *byte ^= mask[(offset + i) % 4];
  }
}

/// Body of a close frame: status code followed by a UTF-8 reason.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
  let mut payload = Vec::with_capacity(2 + reason.len());
  payload.extend_from_slice(&code.to_be_bytes());
  // Reason is truncated to keep the control frame within its size limit.
  let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
  while !reason.is_char_boundary(end) {
    end -= 1;
  }
  payload.extend_from_slice(&reason.as_bytes()[..end]);
  payload
}

/// Splits a received close body into code and reason.
pub fn parse_close_payload(payload: &[u8]) -> (u16, String) {
  if payload.len() < 2 {
    return (CLOSE_NO_STATUS, String::new());
  }
  let code = u16::from_be_bytes([payload[0], payload[1]]);
  (code, String::from_utf8_lossy(&payload[2..]).into_owned())
}

/// Output of [`FrameDecoder::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
  /// Part of a data message. `remaining` counts the bytes still to come in
  /// this frame; `fin` marks the frame that ends the message.
  Data {
    payload: Bytes,
    remaining: usize,
    fin: bool,
    is_binary: bool,
  },
  /// A complete control frame.
  Control { opcode: Opcode, payload: Bytes },
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
  opcode: Opcode,
  fin: bool,
  mask: Option<[u8; 4]>,
  len: u64,
}

#[derive(Debug)]
enum DecodeState {
  Header,
  /// Streaming a data frame's payload.
  Payload {
    header: FrameHeader,
    consumed: u64,
    is_binary: bool,
  },
  /// Buffering a control frame until it is whole.
  Control { header: FrameHeader },
}

/// Incremental frame decoder.
///
/// Data payload is handed out as soon as bytes arrive, each chunk annotated
/// with the bytes remaining in its frame. Control frames are returned whole.
#[derive(Debug)]
pub struct FrameDecoder {
  state: DecodeState,
  max_frame_size: usize,
  /// Message type of a fragmented message in progress.
  message_binary: Option<bool>,
  /// Payload announced so far by the frames of the current message.
  message_len: u64,
}

impl FrameDecoder {
  pub fn new(max_frame_size: usize) -> Self {
    Self {
      state: DecodeState::Header,
      max_frame_size,
      message_binary: None,
      message_len: 0,
    }
  }

  /// Decodes as much of `buf` as possible, consuming it. `Ok(None)` means more input is needed.
  pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>, TransportError> {
    loop {
      match self.state {
        DecodeState::Header => {
          let Some(header) = self.parse_header(buf)? else {
            return Ok(None);
          };
          if header.opcode.is_control() {
            self.state = DecodeState::Control { header };
            continue;
          }
          let is_binary = self.begin_data(header.opcode)?;
          self.message_len = match header.opcode {
            Opcode::Continuation => self.message_len + header.len,
            _ => header.len,
          };
          if self.message_len > self.max_frame_size as u64 {
            return Err(TransportError::ProtocolViolation(format!(
              "fragmented message exceeds limit of {}",
              self.max_frame_size
            )));
          }
          if header.fin {
            self.message_binary = None;
          }
          if header.len == 0 {
            // Empty frames still need reporting when they end the message.
            self.state = DecodeState::Header;
            if header.fin {
              return Ok(Some(Decoded::Data {
                payload: Bytes::new(),
                remaining: 0,
                fin: true,
                is_binary,
              }));
            }
            continue;
          }
          self.state = DecodeState::Payload {
            header,
            consumed: 0,
            is_binary,
          };
        }
        DecodeState::Payload {
          header,
          consumed,
          is_binary,
        } => {
          if buf.is_empty() {
            return Ok(None);
          }
          let left = header.len - consumed;
          let take = (buf.len() as u64).min(left) as usize;
          let mut chunk = buf.split_to(take);
          if let Some(mask) = header.mask {
            apply_mask(&mut chunk, mask, (consumed % 4) as usize);
          }
          let consumed = consumed + take as u64;
          let remaining = (header.len - consumed) as usize;
          self.state = if remaining == 0 {
            DecodeState::Header
          } else {
            DecodeState::Payload {
              header,
              consumed,
              is_binary,
            }
          };
          return Ok(Some(Decoded::Data {
            payload: chunk.freeze(),
            remaining,
            fin: header.fin && remaining == 0,
            is_binary,
          }));
        }
        DecodeState::Control { header } => {
          if (buf.len() as u64) < header.len {
            return Ok(None);
          }
          let mut payload = buf.split_to(header.len as usize);
          if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask, 0);
          }
          self.state = DecodeState::Header;
          return Ok(Some(Decoded::Control {
            opcode: header.opcode,
            payload: payload.freeze(),
          }));
        }
      }
    }
  }

  /// Tracks fragmentation; returns the binary flag of the message the frame belongs to.
  fn begin_data(&mut self, opcode: Opcode) -> Result<bool, TransportError> {
    match (opcode, self.message_binary) {
      (Opcode::Continuation, Some(binary)) => Ok(binary),
      (Opcode::Continuation, None) => Err(TransportError::ProtocolViolation(
        "continuation frame without a message in progress".into(),
      )),
      (_, Some(_)) => Err(TransportError::ProtocolViolation(
        "new data frame while a fragmented message is in progress".into(),
      )),
      (Opcode::Binary, None) => {
        self.message_binary = Some(true);
        Ok(true)
      }
      (_, None) => {
        self.message_binary = Some(false);
        Ok(false)
      }
    }
  }

  fn parse_header(&self, buf: &mut BytesMut) -> Result<Option<FrameHeader>, TransportError> {
    if buf.len() < 2 {
      return Ok(None);
    }
    let first = buf[0];
    let second = buf[1];
    if first & RSV_MASK != 0 {
      return Err(TransportError::ProtocolViolation("reserved bits set without an extension".into()));
    }
    let opcode = Opcode::from_u8(first & OPCODE_MASK)
      .ok_or_else(|| TransportError::ProtocolViolation(format!("unknown opcode {:#x}", first & OPCODE_MASK)))?;
    let fin = first & FIN_BIT != 0;
    let masked = second & MASK_BIT != 0;
    let short_len = second & LEN_MASK;

    let len_bytes = match short_len {
      LEN_16 => 2,
      LEN_64 => 8,
      _ => 0,
    };
    let header_len = 2 + len_bytes + if masked { 4 } else { 0 };
    if buf.len() < header_len {
      return Ok(None);
    }

    let len = match short_len {
      LEN_16 => u16::from_be_bytes([buf[2], buf[3]]) as u64,
      LEN_64 => {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[2..10]);
        u64::from_be_bytes(raw)
      }
      n => n as u64,
    };

    if opcode.is_control() {
      if !fin {
        return Err(TransportError::ProtocolViolation("fragmented control frame".into()));
      }
      if len > MAX_CONTROL_PAYLOAD as u64 {
        return Err(TransportError::ProtocolViolation("control frame payload too long".into()));
      }
    }
    if len > self.max_frame_size as u64 {
      return Err(TransportError::ProtocolViolation(format!(
        "frame of {} bytes exceeds limit of {}",
        len, self.max_frame_size
      )));
    }

    let mask = if masked {
      let at = 2 + len_bytes;
      Some([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    } else {
      None
    };
    buf.advance(header_len);
    Ok(Some(FrameHeader { opcode, fin, mask, len }))
  }
}
