//! Byte-stuffed wire encoding: reserved-byte escaping, payload randomization,
//! CRC-16, and a byte-at-a-time receive state machine.
//!
//! Frames on the wire look like `stuff(control [seq] [payload] crc_hi crc_lo) FLAG`.
//! The CRC is computed over the randomized body (control/seq bytes pass
//! through unrandomized, only the DATA payload is XORed against the LFSR
//! stream) so that a receiver can verify the CRC before it has derandomized
//! anything.

use crc::{Crc, CRC_16_IBM_3740};
use heapless::Vec;

use crate::frame::{Control, FrameKind, SeqByte, MAX_BODY_LEN, MAX_PAYLOAD_LEN};

pub const FLAG: u8 = 0x7E;
pub const ESCAPE: u8 = 0x7D;
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;
pub const SUBSTITUTE: u8 = 0x18;
pub const CANCEL: u8 = 0x1A;
const STUFF_MASK: u8 = 0x20;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

fn is_reserved(byte: u8) -> bool {
    matches!(byte, FLAG | ESCAPE | XON | XOFF | SUBSTITUTE | CANCEL)
}

/// The randomization LFSR. Both ends start every frame from the same seed,
/// so position `n` in the payload always XORs against the same byte.
pub struct Randomizer {
    state: u8,
}

impl Randomizer {
    pub fn new() -> Self {
        Randomizer { state: 0x42 }
    }

    fn next(&mut self) -> u8 {
        let out = self.state;
        self.state = if self.state & 1 != 0 {
            (self.state >> 1) ^ 0xB8
        } else {
            self.state >> 1
        };
        out
    }
}

impl Default for Randomizer {
    fn default() -> Self {
        Self::new()
    }
}

fn randomize(buf: &mut [u8]) {
    let mut rnd = Randomizer::new();
    for byte in buf {
        *byte ^= rnd.next();
    }
}

/// A frame fully decoded from the wire, before the link engine interprets it.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub control: Control,
    pub seq: SeqByte,
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
}

/// Errors local to a single frame. The link stays up; the frame is simply
/// discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    CrcMismatch,
    Truncated,
    Oversized,
    BadControlByte,
    Cancelled,
    IoSubstituted,
    /// A `send()` payload with no bytes at all; the decoder never raises
    /// this itself.
    TooShort,
    /// An ack number that names neither the next unsent FRM nor any FRM
    /// still in the retransmit queue; the decoder never raises this
    /// itself, `LinkEngine::ack_window` does.
    BadAck,
}

/// A signal distinct from a frame: XON/XOFF flow control, or a mid-frame
/// cancel/substitute that the caller may want to observe even though it
/// does not itself complete a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    Xon,
    Xoff,
}

pub enum DecodeEvent {
    /// No frame completed yet; keep feeding bytes.
    Pending,
    Flow(FlowSignal),
    Frame(RawFrame),
    Error(FrameError),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RxState {
    /// Waiting for the start of a frame (any byte before the first FLAG is
    /// noise from a mid-stream attach and is dropped silently).
    Idle,
    Collecting,
    Escaped,
    /// A SUBSTITUTE byte was seen; swallow bytes until FLAG and report the
    /// frame as IoSubstituted once it ends.
    Substituted,
}

/// Byte-at-a-time receiver. Owns no I/O; the transport loop feeds it bytes
/// one at a time and acts on the returned event.
pub struct FrameDecoder {
    state: RxState,
    buf: Vec<u8, MAX_BODY_LEN>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder { state: RxState::Idle, buf: Vec::new() }
    }

    pub fn process_byte(&mut self, byte: u8) -> DecodeEvent {
        match byte {
            CANCEL => {
                let had_data = !self.buf.is_empty();
                self.buf.clear();
                self.state = RxState::Idle;
                if had_data {
                    DecodeEvent::Error(FrameError::Cancelled)
                } else {
                    DecodeEvent::Pending
                }
            }
            SUBSTITUTE => {
                self.buf.clear();
                self.state = RxState::Substituted;
                DecodeEvent::Pending
            }
            XON => DecodeEvent::Flow(FlowSignal::Xon),
            XOFF => DecodeEvent::Flow(FlowSignal::Xoff),
            FLAG => self.on_flag(),
            ESCAPE if self.state == RxState::Collecting => {
                self.state = RxState::Escaped;
                DecodeEvent::Pending
            }
            _ => self.on_body_byte(byte),
        }
    }

    fn on_flag(&mut self) -> DecodeEvent {
        let was_substituted = self.state == RxState::Substituted;
        let body_len = self.buf.len();
        self.state = RxState::Collecting;
        if was_substituted {
            self.buf.clear();
            return DecodeEvent::Error(FrameError::IoSubstituted);
        }
        if body_len == 0 {
            return DecodeEvent::Pending;
        }
        let result = Self::finish_frame(&mut self.buf);
        self.buf.clear();
        match result {
            Ok(frame) => DecodeEvent::Frame(frame),
            Err(err) => DecodeEvent::Error(err),
        }
    }

    fn on_body_byte(&mut self, byte: u8) -> DecodeEvent {
        let resolved = if self.state == RxState::Escaped { byte ^ STUFF_MASK } else { byte };
        if self.state == RxState::Substituted {
            return DecodeEvent::Pending;
        }
        self.state = RxState::Collecting;
        if self.buf.push(resolved).is_err() {
            self.state = RxState::Idle;
            self.buf.clear();
            return DecodeEvent::Error(FrameError::Oversized);
        }
        DecodeEvent::Pending
    }

    fn finish_frame(buf: &mut Vec<u8, MAX_BODY_LEN>) -> Result<RawFrame, FrameError> {
        if buf.len() < 3 {
            return Err(FrameError::Truncated);
        }
        let crc_start = buf.len() - 2;
        let received_crc = u16::from_be_bytes([buf[crc_start], buf[crc_start + 1]]);
        let computed_crc = CRC16.checksum(&buf[..crc_start]);
        if received_crc != computed_crc {
            return Err(FrameError::CrcMismatch);
        }

        let control = Control::from_byte(buf[0]).ok_or(FrameError::BadControlByte)?;
        let mut offset = 1;
        let seq = if control.kind.has_seq_byte() {
            if crc_start < offset + 1 {
                return Err(FrameError::Truncated);
            }
            let s = SeqByte::from_byte(buf[offset]);
            offset += 1;
            s
        } else {
            SeqByte::default()
        };

        let mut payload: Vec<u8, MAX_PAYLOAD_LEN> = Vec::new();
        if control.kind.has_payload() {
            let payload_bytes = &mut buf[offset..crc_start];
            randomize(payload_bytes);
            payload
                .extend_from_slice(payload_bytes)
                .map_err(|_| FrameError::Oversized)?;
        } else if offset != crc_start {
            return Err(FrameError::Truncated);
        }

        Ok(RawFrame { control, seq, payload })
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes a logical frame into its stuffed, terminated wire form. Returns
/// the number of bytes written, or `None` if `out` was too small.
pub fn encode_frame(
    control: Control,
    seq: SeqByte,
    payload: &[u8],
    out: &mut [u8],
) -> Option<usize> {
    let mut body: Vec<u8, MAX_BODY_LEN> = Vec::new();
    body.push(control.to_byte()).ok()?;
    if control.kind.has_seq_byte() {
        body.push(seq.to_byte()).ok()?;
    }
    if control.kind.has_payload() {
        let start = body.len();
        body.extend_from_slice(payload).ok()?;
        randomize(&mut body[start..]);
    }
    let crc = CRC16.checksum(&body);
    body.extend_from_slice(&crc.to_be_bytes()).ok()?;

    let mut written = 0usize;
    for &byte in body.iter() {
        if is_reserved(byte) {
            *out.get_mut(written)? = ESCAPE;
            written += 1;
            *out.get_mut(written)? = byte ^ STUFF_MASK;
        } else {
            *out.get_mut(written)? = byte;
        }
        written += 1;
    }
    *out.get_mut(written)? = FLAG;
    written += 1;
    Some(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;

    fn decode_all(decoder: &mut FrameDecoder, bytes: &[u8]) -> Vec<DecodeEventKind, 8> {
        let mut events = Vec::new();
        for &b in bytes {
            let ev = decoder.process_byte(b);
            let kind = match ev {
                DecodeEvent::Pending => continue,
                DecodeEvent::Flow(f) => DecodeEventKind::Flow(f),
                DecodeEvent::Frame(f) => DecodeEventKind::Frame(f),
                DecodeEvent::Error(e) => DecodeEventKind::Error(e),
            };
            let _ = events.push(kind);
        }
        events
    }

    enum DecodeEventKind {
        Flow(FlowSignal),
        Frame(RawFrame),
        Error(FrameError),
    }

    #[test]
    fn data_frame_round_trips_through_codec() {
        let control = Control::new(FrameKind::Data, false, false);
        let seq = SeqByte { frm: 3, ack: 5 };
        let payload = [0x7Eu8, 0x00, 0x7D, 0xFF, 0x11, 0x13, 0x18, 0x1A];

        let mut wire = [0u8; MAX_BODY_LEN * 2 + 4];
        let len = encode_frame(control, seq, &payload, &mut wire).unwrap();
        assert_eq!(wire[len - 1], FLAG);

        let mut decoder = FrameDecoder::new();
        let events = decode_all(&mut decoder, &wire[..len]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            DecodeEventKind::Frame(frame) => {
                assert_eq!(frame.control, control);
                assert_eq!(frame.seq, seq);
                assert_eq!(frame.payload.as_slice(), &payload[..]);
            }
            _ => panic!("expected a decoded frame"),
        }
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let control = Control::new(FrameKind::Ack, false, false);
        let seq = SeqByte { frm: 0, ack: 2 };
        let mut wire = [0u8; 16];
        let len = encode_frame(control, seq, &[], &mut wire).unwrap();
        // Flip a body bit without touching the terminating FLAG.
        wire[0] ^= 0x01;

        let mut decoder = FrameDecoder::new();
        let events = decode_all(&mut decoder, &wire[..len]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DecodeEventKind::Error(FrameError::CrcMismatch)));
    }

    #[test]
    fn cancel_mid_frame_discards_it() {
        let control = Control::new(FrameKind::Data, false, false);
        let seq = SeqByte { frm: 1, ack: 1 };
        let mut wire = [0u8; 16];
        let len = encode_frame(control, seq, &[1, 2, 3], &mut wire).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut events: Vec<DecodeEventKind, 8> = Vec::new();
        for (i, &b) in wire[..len].iter().enumerate() {
            if i == 2 {
                if let DecodeEvent::Error(e) = decoder.process_byte(CANCEL) {
                    let _ = events.push(DecodeEventKind::Error(e));
                }
            }
            match decoder.process_byte(b) {
                DecodeEvent::Error(e) => {
                    let _ = events.push(DecodeEventKind::Error(e));
                }
                DecodeEvent::Frame(f) => {
                    let _ = events.push(DecodeEventKind::Frame(f));
                }
                _ => {}
            }
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, DecodeEventKind::Error(FrameError::Cancelled))));
    }

    #[test]
    fn xon_xoff_are_reported_as_flow_signals() {
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.process_byte(XOFF),
            DecodeEvent::Flow(FlowSignal::Xoff)
        ));
        assert!(matches!(
            decoder.process_byte(XON),
            DecodeEvent::Flow(FlowSignal::Xon)
        ));
    }
}
