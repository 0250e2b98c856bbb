//! Fixed-size binary framing for [`SyncMessage`].
//!
//! Every message is one 40-byte little-endian frame, so a reader never has to
//! parse a length before knowing where the next frame starts:
//!
//! ```text
//! ┌────────┬─────────┬──────┬──────────┬──────────────┬──────────┬──────────┐
//! │ Magic  │ Version │ Kind │ Sequence │ Payload      │ Reserved │ Checksum │
//! │ 2 bytes│ 1 byte  │ 1    │ 4 bytes  │ 30 bytes     │ 2 bytes  │ 2 bytes  │
//! └────────┴─────────┴──────┴──────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! The checksum is Fletcher-16 over bytes 0..38. [`FrameDecoder`] accepts an
//! arbitrary byte stream and resynchronizes on the magic after corruption.
//!
//! | Kind | Name  | Payload |
//! |------|-------|---------|
//! | 0x01 | Swing | timestamp u64, tier u8, pad u8, point u16, stroke u16, dir x f32, dir y f32, spin f32 |
//! | 0x02 | Ack   | next expected sequence u32 |
//! | 0x03 | Ping  | next expected sequence u32 |
//! | 0x04 | Reset | points played u16, sender score u16, receiver score u16, sender serves next u8 |

use log::trace;

use crate::error::WireError;
use crate::types::{ForceTier, ResetSnapshot, StrokeId, SwingEvent};

/// Magic bytes for frame validation: "AR" (0x4152).
pub const WIRE_MAGIC: u16 = 0x4152;

pub const WIRE_VERSION: u8 = 1;

pub const FRAME_LEN: usize = 40;

const PAYLOAD_START: usize = 8;
const PAYLOAD_LEN: usize = 30;
const CHECKSUM_AT: usize = 38;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Swing = 0x01,
    Ack = 0x02,
    Ping = 0x03,
    Reset = 0x04,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(MessageKind::Swing),
            0x02 => Some(MessageKind::Ack),
            0x03 => Some(MessageKind::Ping),
            0x04 => Some(MessageKind::Reset),
            _ => None,
        }
    }
}

/// Message body, keyed by kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    Swing { stroke: StrokeId, event: SwingEvent },
    /// Acknowledges the message's sequence number. `next_expected` lower than
    /// that number asks the sender to retransmit the gap.
    Ack { next_expected: u32 },
    Ping { next_expected: u32 },
    Reset(ResetSnapshot),
}

/// Envelope exchanged between the two devices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncMessage {
    /// Reliable messages (Swing, Reset): the sender's sequence number.
    /// Ack: the sequence number being acknowledged. Ping: the ping counter.
    pub seq: u32,
    pub payload: Payload,
}

impl SyncMessage {
    pub fn swing(seq: u32, stroke: StrokeId, event: SwingEvent) -> Self {
        Self { seq, payload: Payload::Swing { stroke, event } }
    }

    pub fn ack(seq: u32, next_expected: u32) -> Self {
        Self { seq, payload: Payload::Ack { next_expected } }
    }

    pub fn ping(seq: u32, next_expected: u32) -> Self {
        Self { seq, payload: Payload::Ping { next_expected } }
    }

    pub fn reset(seq: u32, snapshot: ResetSnapshot) -> Self {
        Self { seq, payload: Payload::Reset(snapshot) }
    }

    pub fn kind(&self) -> MessageKind {
        match self.payload {
            Payload::Swing { .. } => MessageKind::Swing,
            Payload::Ack { .. } => MessageKind::Ack,
            Payload::Ping { .. } => MessageKind::Ping,
            Payload::Reset(_) => MessageKind::Reset,
        }
    }

    /// Swing and Reset are retransmitted until acknowledged.
    pub fn is_reliable(&self) -> bool {
        matches!(self.kind(), MessageKind::Swing | MessageKind::Reset)
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0..2].copy_from_slice(&WIRE_MAGIC.to_le_bytes());
        buf[2] = WIRE_VERSION;
        buf[3] = self.kind() as u8;
        buf[4..8].copy_from_slice(&self.seq.to_le_bytes());

        let p = &mut buf[PAYLOAD_START..PAYLOAD_START + PAYLOAD_LEN];
        match self.payload {
            Payload::Swing { stroke, event } => {
                p[0..8].copy_from_slice(&event.timestamp_ms.to_le_bytes());
                p[8] = event.force.to_u8();
                p[10..12].copy_from_slice(&stroke.point.to_le_bytes());
                p[12..14].copy_from_slice(&stroke.stroke.to_le_bytes());
                p[14..18].copy_from_slice(&event.direction[0].to_bits().to_le_bytes());
                p[18..22].copy_from_slice(&event.direction[1].to_bits().to_le_bytes());
                p[22..26].copy_from_slice(&event.spin.to_bits().to_le_bytes());
            }
            Payload::Ack { next_expected } | Payload::Ping { next_expected } => {
                p[0..4].copy_from_slice(&next_expected.to_le_bytes());
            }
            Payload::Reset(snapshot) => {
                p[0..2].copy_from_slice(&snapshot.points_played.to_le_bytes());
                p[2..4].copy_from_slice(&snapshot.score_sender.to_le_bytes());
                p[4..6].copy_from_slice(&snapshot.score_receiver.to_le_bytes());
                p[6] = snapshot.sender_serves_next as u8;
            }
        }

        let checksum = fletcher16(&buf[..CHECKSUM_AT]);
        buf[CHECKSUM_AT..].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < FRAME_LEN {
            return Err(WireError::Truncated(buf.len()));
        }
        let buf = &buf[..FRAME_LEN];
        let magic = u16::from_le_bytes([buf[0], buf[1]]);
        if magic != WIRE_MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let expected = u16::from_le_bytes([buf[CHECKSUM_AT], buf[CHECKSUM_AT + 1]]);
        let actual = fletcher16(&buf[..CHECKSUM_AT]);
        if expected != actual {
            return Err(WireError::BadChecksum { expected, actual });
        }
        if buf[2] != WIRE_VERSION {
            return Err(WireError::BadVersion(buf[2]));
        }
        let kind = MessageKind::from_u8(buf[3]).ok_or(WireError::UnknownKind(buf[3]))?;
        let seq = read_u32(buf, 4);

        let p = &buf[PAYLOAD_START..PAYLOAD_START + PAYLOAD_LEN];
        let payload = match kind {
            MessageKind::Swing => {
                let force = ForceTier::from_u8(p[8]).ok_or(WireError::BadPayload("force tier"))?;
                let direction = [read_f32(p, 14), read_f32(p, 18)];
                let spin = read_f32(p, 22);
                if !direction.iter().all(|v| v.is_finite()) || !spin.is_finite() {
                    return Err(WireError::BadPayload("non-finite swing vector"));
                }
                Payload::Swing {
                    stroke: StrokeId::new(read_u16(p, 10), read_u16(p, 12)),
                    event: SwingEvent::new(read_u64(p, 0), force, direction, spin),
                }
            }
            MessageKind::Ack => Payload::Ack { next_expected: read_u32(p, 0) },
            MessageKind::Ping => Payload::Ping { next_expected: read_u32(p, 0) },
            MessageKind::Reset => {
                let sender_serves_next = match p[6] {
                    0 => false,
                    1 => true,
                    _ => return Err(WireError::BadPayload("serve flag")),
                };
                Payload::Reset(ResetSnapshot {
                    points_played: read_u16(p, 0),
                    score_sender: read_u16(p, 2),
                    score_receiver: read_u16(p, 4),
                    sender_serves_next,
                })
            }
        };
        Ok(Self { seq, payload })
    }
}

/// Splits a byte stream into frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Set after a bad frame so the bytes skipped while resynchronizing are
    /// not reported again.
    resyncing: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(FRAME_LEN * 4),
            resyncing: false,
        }
    }

    /// Append received bytes and decode every complete frame. Corrupt frames
    /// come back as errors; the decoder skips ahead to the next magic.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<SyncMessage, WireError>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        let magic = WIRE_MAGIC.to_le_bytes();

        loop {
            let Some(start) = self.buf.windows(2).position(|w| w == magic) else {
                // Keep a trailing byte in case it is the first half of a magic.
                let keep = usize::from(self.buf.last() == Some(&magic[0]));
                let dropped = self.buf.len() - keep;
                if dropped > 0 {
                    self.skip(dropped, &mut out);
                }
                break;
            };
            if start > 0 {
                self.skip(start, &mut out);
            }
            if self.buf.len() < FRAME_LEN {
                break;
            }
            match SyncMessage::decode(&self.buf[..FRAME_LEN]) {
                Ok(msg) => {
                    out.push(Ok(msg));
                    self.buf.drain(..FRAME_LEN);
                    self.resyncing = false;
                }
                Err(e) => {
                    out.push(Err(e));
                    self.resyncing = true;
                    // Step past this magic and rescan.
                    self.buf.drain(..1);
                }
            }
        }
        out
    }

    /// Bytes waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn skip(&mut self, n: usize, out: &mut Vec<Result<SyncMessage, WireError>>) {
        trace!("skipping {} bytes outside any frame", n);
        if !self.resyncing {
            let magic = if n >= 2 { u16::from_le_bytes([self.buf[0], self.buf[1]]) } else { 0 };
            out.push(Err(WireError::BadMagic(magic)));
            self.resyncing = true;
        }
        self.buf.drain(..n);
    }
}

/// Fletcher-16 over `data`.
pub fn fletcher16(data: &[u8]) -> u16 {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;
    for &b in data {
        sum1 = (sum1 + b as u16) % 255;
        sum2 = (sum2 + sum1) % 255;
    }
    (sum2 << 8) | sum1
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn read_f32(buf: &[u8], at: usize) -> f32 {
    f32::from_bits(read_u32(buf, at))
}
