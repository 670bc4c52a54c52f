//! Message demarcation.
//!
//! A [`FrameEngine`] turns the bytes a connection received during one tick
//! into zero or more complete messages, and turns outgoing messages into the
//! bytes the connection should write. Two engines implement the contract:
//!
//! - [`ProtocolEngine`] speaks RFC 6455 framing: client-side masking,
//!   fragmentation reassembly, ping/pong, and the close handshake.
//! - [`RawEngine`] is a restricted-compatibility mode. Every received span is
//!   one opaque message and outgoing bytes are written verbatim. It performs
//!   no masking, no reassembly, and no close negotiation, so peers that speak
//!   real WebSocket framing will see protocol violations. Only use it against
//!   endpoints known to echo raw bytes.
//!
//! Message payloads are written back into the front of the connection's own
//! buffer, so a message never outlives the tick it was delivered in.

use bytes::{Buf, BytesMut};
use fastwebsockets::{Frame, OpCode, Payload};
use serde::Deserialize;
use smallvec::SmallVec;

/// Lengths of consecutive messages laid out from the start of the buffer.
pub type MessageQueue = SmallVec<[usize; 8]>;

const MAX_CONTROL_PAYLOAD: u64 = 125;
const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameMode {
    #[default]
    Protocol,
    Raw,
}

impl FrameMode {
    pub fn build(self, capacity: usize) -> Box<dyn FrameEngine> {
        match self {
            FrameMode::Protocol => Box::new(ProtocolEngine::new(capacity)),
            FrameMode::Raw => Box::new(RawEngine::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("fragmented control frame")]
    FragmentedControl,
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLong(u64),
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("new data frame while a fragmented message is in progress")]
    Interleaved,
    #[error("message of {len} bytes exceeds the {capacity} byte buffer")]
    MessageTooLarge { len: u64, capacity: usize },
    #[error("text message is not valid utf-8")]
    InvalidUtf8,
    #[error("malformed close frame")]
    InvalidClose,
}

pub trait FrameEngine {
    /// Demarcates `buf[..len]`. Complete message payloads are written back to
    /// the front of `buf`, one after the other, and their lengths pushed onto
    /// `messages`. Incomplete trailing data is retained for the next call.
    fn feed(
        &mut self,
        buf: &mut [u8],
        len: usize,
        messages: &mut MessageQueue,
    ) -> Result<(), ProtocolError>;

    /// Bytes retained from earlier feeds. Complete messages among them are
    /// delivered by a later `feed`, even one with no new bytes.
    fn backlog(&self) -> usize;

    fn queue(&mut self, kind: MessageKind, payload: &[u8]);

    /// Starts a protocol-level close.
    fn close(&mut self);

    /// The peer asked to close, or the close handshake finished.
    fn wants_close(&self) -> bool;

    /// Whether the peer closing the stream right now would be orderly.
    fn clean_eof(&self) -> bool;

    fn pending_output(&self) -> &[u8];

    fn consume_output(&mut self, n: usize);
}

#[derive(Debug, Default)]
pub struct RawEngine {
    outbound: BytesMut,
}

impl FrameEngine for RawEngine {
    fn feed(
        &mut self,
        _buf: &mut [u8],
        len: usize,
        messages: &mut MessageQueue,
    ) -> Result<(), ProtocolError> {
        if len > 0 {
            messages.push(len);
        }
        Ok(())
    }

    fn backlog(&self) -> usize {
        0
    }

    fn queue(&mut self, _kind: MessageKind, payload: &[u8]) {
        self.outbound.extend_from_slice(payload);
    }

    fn close(&mut self) {}

    fn wants_close(&self) -> bool {
        false
    }

    fn clean_eof(&self) -> bool {
        true
    }

    fn pending_output(&self) -> &[u8] {
        &self.outbound
    }

    fn consume_output(&mut self, n: usize) {
        self.outbound.advance(n);
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    len: usize,
    payload_len: u64,
}

fn opcode(bits: u8) -> Result<OpCode, ProtocolError> {
    Ok(match bits {
        0x0 => OpCode::Continuation,
        0x1 => OpCode::Text,
        0x2 => OpCode::Binary,
        0x8 => OpCode::Close,
        0x9 => OpCode::Ping,
        0xA => OpCode::Pong,
        other => return Err(ProtocolError::UnknownOpcode(other)),
    })
}

fn is_control(op: OpCode) -> bool {
    matches!(op, OpCode::Close | OpCode::Ping | OpCode::Pong)
}

fn parse_header(buf: &[u8]) -> Result<Option<Header>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let (b0, b1) = (buf[0], buf[1]);
    if b0 & 0x70 != 0 {
        return Err(ProtocolError::ReservedBits);
    }
    let fin = b0 & 0x80 != 0;
    let opcode = opcode(b0 & 0x0F)?;
    let masked = b1 & 0x80 != 0;

    let (payload_len, mut len) = match b1 & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut be = [0u8; 8];
            be.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(be), 10)
        }
        n => (n as u64, 2),
    };

    if is_control(opcode) {
        if !fin {
            return Err(ProtocolError::FragmentedControl);
        }
        if payload_len > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlTooLong(payload_len));
        }
    }

    let mask = if masked {
        if buf.len() < len + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[len..len + 4]);
        len += 4;
        Some(key)
    } else {
        None
    };

    Ok(Some(Header {
        fin,
        opcode,
        mask,
        len,
        payload_len,
    }))
}

/// RFC 6455 client framing.
#[derive(Debug)]
pub struct ProtocolEngine {
    capacity: usize,
    inbound: BytesMut,
    fragments: BytesMut,
    fragment_kind: Option<MessageKind>,
    outbound: BytesMut,
    scratch: Vec<u8>,
    close_sent: bool,
    close_received: bool,
}

impl ProtocolEngine {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inbound: BytesMut::with_capacity(capacity),
            fragments: BytesMut::new(),
            fragment_kind: None,
            outbound: BytesMut::new(),
            scratch: Vec::new(),
            close_sent: false,
            close_received: false,
        }
    }

    fn queue_frame(&mut self, mut frame: Frame<'_>) {
        frame.mask();
        let bytes = frame.write(&mut self.scratch);
        self.outbound.extend_from_slice(bytes);
    }

    fn on_close(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let code = match payload.len() {
            0 => CLOSE_NORMAL,
            1 => return Err(ProtocolError::InvalidClose),
            _ => {
                std::str::from_utf8(&payload[2..]).map_err(|_| ProtocolError::InvalidClose)?;
                u16::from_be_bytes([payload[0], payload[1]])
            }
        };
        tracing::debug!(code, "close frame received");
        self.close_received = true;
        if !self.close_sent {
            self.close_sent = true;
            self.queue_frame(Frame::close(code, b""));
        }
        Ok(())
    }

    fn deliver(
        kind: MessageKind,
        payload: &[u8],
        buf: &mut [u8],
        out: &mut usize,
        messages: &mut MessageQueue,
    ) -> Result<(), ProtocolError> {
        if kind == MessageKind::Text {
            std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        }
        let end = *out + payload.len();
        if end > buf.len() {
            return Err(ProtocolError::MessageTooLarge {
                len: payload.len() as u64,
                capacity: buf.len(),
            });
        }
        buf[*out..end].copy_from_slice(payload);
        messages.push(payload.len());
        *out = end;
        Ok(())
    }
}

impl FrameEngine for ProtocolEngine {
    fn feed(
        &mut self,
        buf: &mut [u8],
        len: usize,
        messages: &mut MessageQueue,
    ) -> Result<(), ProtocolError> {
        self.inbound.extend_from_slice(&buf[..len]);
        let mut out = 0;

        while let Some(header) = parse_header(&self.inbound)? {
            // Control frames are capped by parse_header and never join a
            // fragmented message.
            let message_len = match header.opcode {
                OpCode::Continuation => header
                    .payload_len
                    .saturating_add(self.fragments.len() as u64),
                OpCode::Text | OpCode::Binary => header.payload_len,
                _ => 0,
            };
            if message_len > self.capacity as u64 {
                return Err(ProtocolError::MessageTooLarge {
                    len: message_len,
                    capacity: self.capacity,
                });
            }
            let frame_len = header.len + header.payload_len as usize;
            if self.inbound.len() < frame_len {
                break;
            }
            // A finished message that no longer fits behind this call's
            // earlier messages waits for the next feed.
            if header.fin && !self.close_received && message_len > (buf.len() - out) as u64 {
                break;
            }

            let mut payload = self.inbound.split_to(frame_len);
            payload.advance(header.len);
            if let Some(mask) = header.mask {
                fastwebsockets::unmask(&mut payload, mask);
            }
            if self.close_received {
                continue;
            }

            match header.opcode {
                OpCode::Ping => self.queue_frame(Frame::pong(Payload::Owned(payload.to_vec()))),
                OpCode::Pong => {}
                OpCode::Close => self.on_close(&payload)?,
                OpCode::Text | OpCode::Binary => {
                    if self.fragment_kind.is_some() {
                        return Err(ProtocolError::Interleaved);
                    }
                    let kind = if matches!(header.opcode, OpCode::Text) {
                        MessageKind::Text
                    } else {
                        MessageKind::Binary
                    };
                    if header.fin {
                        Self::deliver(kind, &payload, buf, &mut out, messages)?;
                    } else {
                        self.fragment_kind = Some(kind);
                        self.fragments.extend_from_slice(&payload);
                    }
                }
                OpCode::Continuation => {
                    let kind = self
                        .fragment_kind
                        .ok_or(ProtocolError::UnexpectedContinuation)?;
                    self.fragments.extend_from_slice(&payload);
                    if header.fin {
                        let message = self.fragments.split();
                        self.fragment_kind = None;
                        Self::deliver(kind, &message, buf, &mut out, messages)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn backlog(&self) -> usize {
        self.inbound.len() + self.fragments.len()
    }

    fn queue(&mut self, kind: MessageKind, payload: &[u8]) {
        let payload = Payload::Owned(payload.to_vec());
        let frame = match kind {
            MessageKind::Text => Frame::text(payload),
            MessageKind::Binary => Frame::binary(payload),
        };
        self.queue_frame(frame);
    }

    fn close(&mut self) {
        if !self.close_sent {
            self.close_sent = true;
            self.queue_frame(Frame::close(CLOSE_NORMAL, b""));
        }
    }

    fn wants_close(&self) -> bool {
        self.close_received
    }

    fn clean_eof(&self) -> bool {
        self.close_received
    }

    fn pending_output(&self) -> &[u8] {
        &self.outbound
    }

    fn consume_output(&mut self, n: usize) {
        self.outbound.advance(n);
    }
}
