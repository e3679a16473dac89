// Wire framing: length-prefixed packets, the application/handshake type
// partition, sealing, and stream reassembly.
//
// Every wire unit is a big-endian u32 length prefix followed by exactly
// that many bytes. For cleartext packets the prefixed body is one type
// byte plus the payload. For sealed packets the prefix stays cleartext so
// the stream can be cut into frames, and the body is the AEAD ciphertext
// of an entire framed packet (inner prefix included) plus the tag.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use keeltrust::{AeadSession, StepKind};

use crate::error::{KeelWireError, Result};

/// Length prefix size.
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Smallest well-formed cleartext frame: prefix plus type byte.
pub const MIN_FRAME_LEN: usize = LENGTH_PREFIX_LEN + 1;
/// Reassembly refuses frames whose declared body exceeds this.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// First packet type byte of the handshake sub-range.
pub const HANDSHAKE_THRESHOLD_BEGIN: u8 = 0x10;
/// One past the last handshake packet type byte.
pub const HANDSHAKE_THRESHOLD_END: u8 = 0x19;

// ── Packet types ─────────────────────────────────────────────────────────

/// Wire packet types. Application traffic sits below the handshake
/// threshold, handshake steps inside [0x10, 0x19).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    // Application range: 0x00 - 0x03
    Undefined = 0x00,
    SinglePacket = 0x01,
    Heartbeat = 0x02,
    Disconnect = 0x03,
    // Handshake range: 0x10 - 0x18
    Start = 0x10,
    PresentPubKey = 0x11,
    PresentPubKeyChild = 0x12,
    EncInit = 0x13,
    EncAck = 0x14,
    Rekey = 0x15,
    AuthChallenge = 0x16,
    AuthReply = 0x17,
    AuthPropose = 0x18,
}

impl TryFrom<u8> for PacketType {
    type Error = KeelWireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(PacketType::Undefined),
            0x01 => Ok(PacketType::SinglePacket),
            0x02 => Ok(PacketType::Heartbeat),
            0x03 => Ok(PacketType::Disconnect),
            0x10 => Ok(PacketType::Start),
            0x11 => Ok(PacketType::PresentPubKey),
            0x12 => Ok(PacketType::PresentPubKeyChild),
            0x13 => Ok(PacketType::EncInit),
            0x14 => Ok(PacketType::EncAck),
            0x15 => Ok(PacketType::Rekey),
            0x16 => Ok(PacketType::AuthChallenge),
            0x17 => Ok(PacketType::AuthReply),
            0x18 => Ok(PacketType::AuthPropose),
            other => Err(KeelWireError::UnknownPacketType(other)),
        }
    }
}

impl PacketType {
    /// Whether the type byte falls in the handshake sub-range.
    pub fn is_handshake(&self) -> bool {
        is_handshake_byte(*self as u8)
    }

    /// The session-engine step this handshake type carries.
    pub fn step_kind(&self) -> Option<StepKind> {
        match self {
            PacketType::Start => Some(StepKind::Start),
            PacketType::PresentPubKey => Some(StepKind::PresentPubKey),
            PacketType::PresentPubKeyChild => Some(StepKind::PresentPubKeyChild),
            PacketType::EncInit => Some(StepKind::EncInit),
            PacketType::EncAck => Some(StepKind::EncAck),
            PacketType::Rekey => Some(StepKind::Rekey),
            PacketType::AuthChallenge => Some(StepKind::AuthChallenge),
            PacketType::AuthReply => Some(StepKind::AuthReply),
            PacketType::AuthPropose => Some(StepKind::AuthPropose),
            _ => None,
        }
    }

    pub fn from_step(kind: StepKind) -> Self {
        match kind {
            StepKind::Start => PacketType::Start,
            StepKind::PresentPubKey => PacketType::PresentPubKey,
            StepKind::PresentPubKeyChild => PacketType::PresentPubKeyChild,
            StepKind::EncInit => PacketType::EncInit,
            StepKind::EncAck => PacketType::EncAck,
            StepKind::Rekey => PacketType::Rekey,
            StepKind::AuthChallenge => PacketType::AuthChallenge,
            StepKind::AuthReply => PacketType::AuthReply,
            StepKind::AuthPropose => PacketType::AuthPropose,
        }
    }
}

/// Whether a raw type byte is in the handshake sub-range, known or not.
pub fn is_handshake_byte(value: u8) -> bool {
    (HANDSHAKE_THRESHOLD_BEGIN..HANDSHAKE_THRESHOLD_END).contains(&value)
}

/// Routing class of a parsed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    Application(PacketType),
    Handshake(StepKind),
}

// ── Packet ───────────────────────────────────────────────────────────────

/// A parsed or to-be-framed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub ptype: PacketType,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(ptype: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            ptype,
            payload: payload.into(),
        }
    }

    /// Frame this packet: prefix, type byte, payload.
    pub fn build(&self) -> Bytes {
        let body_len = 1 + self.payload.len();
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body_len);
        buf.put_u32(body_len as u32);
        buf.put_u8(self.ptype as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse one complete frame, prefix included. The declared length must
    /// match the remaining bytes exactly; anything else is a malformed
    /// frame, never a panic.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(KeelWireError::FrameTooShort {
                expected: MIN_FRAME_LEN,
                actual: frame.len(),
            });
        }
        let mut buf = frame;
        let declared = buf.get_u32() as usize;
        if declared != buf.remaining() {
            return Err(KeelWireError::LengthMismatch {
                declared,
                remaining: buf.remaining(),
            });
        }
        let ptype = PacketType::try_from(buf.get_u8())?;
        Ok(Self {
            ptype,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Routing class for the dispatch loop.
    pub fn classify(&self) -> PacketClass {
        match self.ptype.step_kind() {
            Some(kind) => PacketClass::Handshake(kind),
            None => PacketClass::Application(self.ptype),
        }
    }
}

// ── Sealed framing ───────────────────────────────────────────────────────

/// Frame and seal a packet: the AEAD plaintext is the whole framed packet,
/// the wire unit is a cleartext prefix over ciphertext plus tag.
pub fn build_sealed(
    ptype: PacketType,
    payload: impl Into<Bytes>,
    session: &mut AeadSession,
) -> Result<Bytes> {
    let inner = Packet::new(ptype, payload).build();
    let sealed = session.seal(&inner).map_err(KeelWireError::Trust)?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + sealed.len());
    buf.put_u32(sealed.len() as u32);
    buf.put_slice(&sealed);
    Ok(buf.freeze())
}

/// Open one sealed frame, prefix included, and parse the inner packet.
pub fn open_sealed(frame: &[u8], session: &mut AeadSession) -> Result<Packet> {
    if frame.len() < LENGTH_PREFIX_LEN {
        return Err(KeelWireError::FrameTooShort {
            expected: LENGTH_PREFIX_LEN,
            actual: frame.len(),
        });
    }
    let plain = session
        .open(&frame[LENGTH_PREFIX_LEN..])
        .map_err(KeelWireError::Trust)?;
    Packet::parse(&plain)
}

// ── Stream reassembly ────────────────────────────────────────────────────

/// Cuts a raw byte stream into complete length-prefixed frames. Partial
/// frames wait for more bytes; multiple frames in one delivery come out
/// one at a time.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buf: BytesMut,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, prefix included.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let declared =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if declared > MAX_FRAME_LEN {
            return Err(KeelWireError::ProtocolViolation(format!(
                "declared frame length {declared} exceeds the {MAX_FRAME_LEN} byte cap"
            )));
        }
        let total = LENGTH_PREFIX_LEN + declared;
        if self.buf.len() < total {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(total).freeze()))
    }

    /// Bytes buffered and not yet cut into a frame.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
