//! Incremental WebSocket frame codec (RFC 6455 §5).
//!
//! [`FrameParser`] is a plain value: feed it whatever bytes the transport
//! delivered and it returns the events that became complete. Bytes of a frame
//! that has not fully arrived stay buffered for the next call, so message
//! boundaries never depend on how the transport chunked the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Close status codes used by the server.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Returns `true` for close codes a peer may legitimately send.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

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
    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            _ => return None,
        })
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Protocol violations detected while parsing client frames.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,

    #[error("client frame is not masked")]
    UnmaskedFrame,

    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    #[error("control frame is fragmented")]
    FragmentedControl,

    #[error("control frame payload exceeds 125 bytes")]
    ControlTooLarge,

    #[error("continuation frame without an open message")]
    UnexpectedContinuation,

    #[error("new data frame while a fragmented message is open")]
    FragmentInProgress,

    #[error("text message is not valid UTF-8")]
    InvalidUtf8,

    #[error("message exceeds maximum payload of {max} bytes")]
    MessageTooLarge { max: usize },

    #[error("close frame payload of one byte")]
    InvalidClosePayload,

    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),

    #[error("close reason is not valid UTF-8")]
    InvalidCloseReason,
}

impl ProtocolError {
    /// The close code the server answers this violation with.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::InvalidUtf8 => close_code::INVALID_PAYLOAD,
            Self::MessageTooLarge { .. } => close_code::MESSAGE_TOO_BIG,
            _ => close_code::PROTOCOL_ERROR,
        }
    }
}

/// A complete data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Text(_) => Opcode::Text,
            Self::Binary(_) => Opcode::Binary,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }

    /// Encodes the message as a single unmasked server frame.
    pub fn to_frame(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(self.opcode(), self.as_bytes(), true, None, &mut buf);
        buf
    }
}

/// Something the parser extracted from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message(Message),
    Ping(Bytes),
    Pong(Bytes),
    /// A close frame. `code` is `None` when the frame had no payload. Codes of
    /// 5000 and above are passed through unvalidated.
    Close { code: Option<u16>, reason: String },
    /// A protocol violation. The parser accepts no further input afterwards.
    Error(ProtocolError),
}

struct Frame {
    fin: bool,
    opcode: Opcode,
    payload: Bytes,
}

struct Fragment {
    opcode: Opcode,
    data: BytesMut,
}

/// Server-side frame parser with a rolling leftover buffer.
pub struct FrameParser {
    buf: BytesMut,
    fragment: Option<Fragment>,
    max_payload: usize,
    failed: bool,
}

impl FrameParser {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            fragment: None,
            max_payload,
            failed: false,
        }
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Appends transport bytes and returns every event that became complete.
    ///
    /// Parsing restarts from the beginning of the buffered bytes on each call;
    /// an incomplete trailing frame is kept for the next one. After an
    /// [`Event::Error`] the parser ignores all further input.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        if self.failed {
            return events;
        }
        self.buf.extend_from_slice(data);
        loop {
            let step = self.next_frame().and_then(|frame| match frame {
                Some(frame) => self.apply(frame).map(Some),
                None => Ok(None),
            });
            match step {
                Ok(Some(Some(event))) => events.push(event),
                Ok(Some(None)) => {}
                Ok(None) => break,
                Err(e) => {
                    self.failed = true;
                    self.buf.clear();
                    self.fragment = None;
                    events.push(Event::Error(e));
                    break;
                }
            }
        }
        events
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let buf = &self.buf[..];
        if buf.len() < 2 {
            return Ok(None);
        }
        let (b0, b1) = (buf[0], buf[1]);
        if b0 & 0x70 != 0 {
            return Err(ProtocolError::ReservedBits);
        }
        let fin = b0 & 0x80 != 0;
        let opcode = Opcode::from_bits(b0 & 0x0F).ok_or(ProtocolError::UnknownOpcode(b0 & 0x0F))?;
        if b1 & 0x80 == 0 {
            return Err(ProtocolError::UnmaskedFrame);
        }

        let (len, header_len) = match b1 & 0x7F {
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
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            n => (n as u64, 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControl);
            }
            if len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(ProtocolError::ControlTooLarge);
            }
        }
        if len > self.max_payload as u64 {
            return Err(ProtocolError::MessageTooLarge {
                max: self.max_payload,
            });
        }

        let len = len as usize;
        if buf.len() < header_len + 4 + len {
            return Ok(None);
        }
        let mask = [
            buf[header_len],
            buf[header_len + 1],
            buf[header_len + 2],
            buf[header_len + 3],
        ];

        self.buf.advance(header_len + 4);
        let mut payload = self.buf.split_to(len);
        apply_mask(&mut payload, mask);
        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }

    fn apply(&mut self, frame: Frame) -> Result<Option<Event>, ProtocolError> {
        match frame.opcode {
            Opcode::Continuation => {
                let fragment = self
                    .fragment
                    .as_mut()
                    .ok_or(ProtocolError::UnexpectedContinuation)?;
                if fragment.data.len() + frame.payload.len() > self.max_payload {
                    return Err(ProtocolError::MessageTooLarge {
                        max: self.max_payload,
                    });
                }
                fragment.data.put_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }
                let Some(done) = self.fragment.take() else {
                    return Err(ProtocolError::UnexpectedContinuation);
                };
                deliver(done.opcode, done.data.freeze()).map(Some)
            }
            Opcode::Text | Opcode::Binary => {
                if self.fragment.is_some() {
                    return Err(ProtocolError::FragmentInProgress);
                }
                if frame.fin {
                    return deliver(frame.opcode, frame.payload).map(Some);
                }
                self.fragment = Some(Fragment {
                    opcode: frame.opcode,
                    data: BytesMut::from(&frame.payload[..]),
                });
                Ok(None)
            }
            Opcode::Close => parse_close(&frame.payload).map(Some),
            Opcode::Ping => Ok(Some(Event::Ping(frame.payload))),
            Opcode::Pong => Ok(Some(Event::Pong(frame.payload))),
        }
    }
}

fn deliver(opcode: Opcode, data: Bytes) -> Result<Event, ProtocolError> {
    let message = match opcode {
        Opcode::Text => Message::Text(
            String::from_utf8(Vec::from(data)).map_err(|_| ProtocolError::InvalidUtf8)?,
        ),
        _ => Message::Binary(data),
    };
    Ok(Event::Message(message))
}

fn parse_close(payload: &[u8]) -> Result<Event, ProtocolError> {
    match payload.len() {
        0 => Ok(Event::Close {
            code: None,
            reason: String::new(),
        }),
        1 => Err(ProtocolError::InvalidClosePayload),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if code < 5000 && !is_valid_close_code(code) {
                return Err(ProtocolError::InvalidCloseCode(code));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| ProtocolError::InvalidCloseReason)?
                .to_owned();
            Ok(Event::Close {
                code: Some(code),
                reason,
            })
        }
    }
}

fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Encodes one frame as header + payload in a single buffer.
///
/// Servers pass `mask: None`; a mask is only used when acting as a client.
pub fn encode_frame(opcode: Opcode, payload: &[u8], fin: bool, mask: Option<[u8; 4]>, dst: &mut BytesMut) {
    dst.reserve(14 + payload.len());
    dst.put_u8(if fin { 0x80 } else { 0 } | opcode.bits());
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    match payload.len() {
        n if n < 126 => dst.put_u8(mask_bit | n as u8),
        n if n <= u16::MAX as usize => {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(n as u16);
        }
        n => {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(n as u64);
        }
    }
    match mask {
        Some(mask) => {
            dst.put_slice(&mask);
            let start = dst.len();
            dst.put_slice(payload);
            apply_mask(&mut dst[start..], mask);
        }
        None => dst.put_slice(payload),
    }
}

/// Encodes a close frame carrying `code` and a reason truncated to fit the
/// control-frame limit.
pub fn encode_close(code: u16, reason: &str) -> BytesMut {
    let mut reason = reason;
    while reason.len() > MAX_CONTROL_PAYLOAD - 2 {
        let mut cut = MAX_CONTROL_PAYLOAD - 2;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason = &reason[..cut];
    }
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    let mut buf = BytesMut::new();
    encode_frame(Opcode::Close, &payload, true, None, &mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn client_frame(opcode: Opcode, payload: &[u8], fin: bool) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(opcode, payload, fin, Some(MASK), &mut buf);
        buf
    }

    #[test]
    fn split_text_frame_reassembles_identically() {
        let wire = client_frame(Opcode::Text, "hello, chunked world".as_bytes(), true);
        let whole = FrameParser::new(1 << 20).feed(&wire);

        for split in 1..wire.len() {
            let mut parser = FrameParser::new(1 << 20);
            let mut events = parser.feed(&wire[..split]);
            assert!(events.is_empty(), "split at {split} delivered early");
            events.extend(parser.feed(&wire[split..]));
            assert_eq!(events, whole);
        }
        assert_eq!(
            whole,
            vec![Event::Message(Message::text("hello, chunked world"))]
        );
    }

    #[test]
    fn extended_lengths() {
        let medium = vec![7u8; 300];
        let large = vec![9u8; 70_000];
        let mut wire = client_frame(Opcode::Binary, &medium, true);
        wire.extend_from_slice(&client_frame(Opcode::Binary, &large, true));
        let events = FrameParser::new(1 << 20).feed(&wire);
        assert_eq!(
            events,
            vec![
                Event::Message(Message::binary(medium)),
                Event::Message(Message::binary(large)),
            ]
        );
    }

    #[test]
    fn fragmented_message_with_interleaved_ping() {
        let mut wire = client_frame(Opcode::Text, b"frag", false);
        wire.extend_from_slice(&client_frame(Opcode::Ping, b"x", true));
        wire.extend_from_slice(&client_frame(Opcode::Continuation, b"mented", true));
        let events = FrameParser::new(1024).feed(&wire);
        assert_eq!(
            events,
            vec![
                Event::Ping(Bytes::from_static(b"x")),
                Event::Message(Message::text("fragmented")),
            ]
        );
    }

    #[test]
    fn continuation_without_start_is_an_error() {
        let events = FrameParser::new(1024).feed(&client_frame(Opcode::Continuation, b"x", true));
        assert_eq!(events, vec![Event::Error(ProtocolError::UnexpectedContinuation)]);
    }

    #[test]
    fn new_message_during_fragment_is_an_error() {
        let mut wire = client_frame(Opcode::Binary, b"a", false);
        wire.extend_from_slice(&client_frame(Opcode::Text, b"b", true));
        let events = FrameParser::new(1024).feed(&wire);
        assert_eq!(events, vec![Event::Error(ProtocolError::FragmentInProgress)]);
    }

    #[test]
    fn invalid_utf8_text_maps_to_1007() {
        let events = FrameParser::new(1024).feed(&client_frame(Opcode::Text, &[0xff, 0xfe], true));
        assert_eq!(events, vec![Event::Error(ProtocolError::InvalidUtf8)]);
        assert_eq!(ProtocolError::InvalidUtf8.close_code(), 1007);
    }

    #[test]
    fn unmasked_and_reserved_bits_are_rejected() {
        let mut unmasked = BytesMut::new();
        encode_frame(Opcode::Text, b"hi", true, None, &mut unmasked);
        assert_eq!(
            FrameParser::new(1024).feed(&unmasked),
            vec![Event::Error(ProtocolError::UnmaskedFrame)]
        );

        let mut rsv = client_frame(Opcode::Text, b"hi", true);
        rsv[0] |= 0x40;
        assert_eq!(
            FrameParser::new(1024).feed(&rsv),
            vec![Event::Error(ProtocolError::ReservedBits)]
        );
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut frame = client_frame(Opcode::Binary, b"", true);
        frame[0] = 0x80 | 0x3;
        assert_eq!(
            FrameParser::new(1024).feed(&frame),
            vec![Event::Error(ProtocolError::UnknownOpcode(0x3))]
        );
    }

    #[test]
    fn control_frame_limits() {
        let big_ping = client_frame(Opcode::Ping, &[0u8; 126], true);
        assert_eq!(
            FrameParser::new(1024).feed(&big_ping),
            vec![Event::Error(ProtocolError::ControlTooLarge)]
        );
        let fragmented_pong = client_frame(Opcode::Pong, b"p", false);
        assert_eq!(
            FrameParser::new(1024).feed(&fragmented_pong),
            vec![Event::Error(ProtocolError::FragmentedControl)]
        );
    }

    #[test]
    fn oversized_message_maps_to_1009() {
        let events = FrameParser::new(4).feed(&client_frame(Opcode::Binary, b"12345", true));
        assert_eq!(
            events,
            vec![Event::Error(ProtocolError::MessageTooLarge { max: 4 })]
        );
        assert_eq!(events_close_code(&events), Some(1009));
    }

    fn events_close_code(events: &[Event]) -> Option<u16> {
        events.iter().find_map(|e| match e {
            Event::Error(err) => Some(err.close_code()),
            _ => None,
        })
    }

    #[test]
    fn close_frame_validation() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        assert_eq!(
            FrameParser::new(1024).feed(&client_frame(Opcode::Close, &payload, true)),
            vec![Event::Close {
                code: Some(1000),
                reason: "bye".into()
            }]
        );

        assert_eq!(
            FrameParser::new(1024).feed(&client_frame(Opcode::Close, &1005u16.to_be_bytes(), true)),
            vec![Event::Error(ProtocolError::InvalidCloseCode(1005))]
        );
        assert_eq!(
            FrameParser::new(1024).feed(&client_frame(Opcode::Close, &[3], true)),
            vec![Event::Error(ProtocolError::InvalidClosePayload)]
        );

        let high = client_frame(Opcode::Close, &5001u16.to_be_bytes(), true);
        assert_eq!(
            FrameParser::new(1024).feed(&high),
            vec![Event::Close {
                code: Some(5001),
                reason: String::new()
            }]
        );
    }

    #[test]
    fn parser_stops_after_error() {
        let mut parser = FrameParser::new(1024);
        parser.feed(&client_frame(Opcode::Continuation, b"x", true));
        assert!(parser.feed(&client_frame(Opcode::Text, b"ok", true)).is_empty());
    }

    #[test]
    fn close_reason_is_truncated_on_char_boundary() {
        let frame = encode_close(1000, &"é".repeat(100));
        assert!(frame.len() <= 2 + MAX_CONTROL_PAYLOAD);
        let reason = &frame[4..];
        assert!(std::str::from_utf8(reason).is_ok());
    }
}
