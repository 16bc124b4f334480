//! Wire codec: byte stuffing, CRC-16-CCITT, and the frame layout
//!
//! ```text
//! FLAG | stuffed( CONTROL | SEQ | PAYLOAD | CRC16 ) | FLAG
//! ```
//!
//! The CRC is computed over `CONTROL | SEQ | PAYLOAD` and appended big-endian
//! before stuffing, so nothing between the two flags can contain a bare FLAG.

use crc::{Crc, Table, CRC_16_GENIBUS};

use crate::link::{FrameType, MAX_DATA};
use crate::Error;

/// Frame delimiter.
pub const FLAG: u8 = 0x7e;
/// Escape prefix inside the delimiters.
pub const ESC: u8 = 0x7d;
/// XORed onto an escaped byte.
const STUFF_XOR: u8 = 0x20;

/// Poly 0x1021, init 0xffff, no reflection, final xor 0xffff.
const FRAME_CRC: Crc<u16, Table<1>> = Crc::<u16, Table<1>>::new(&CRC_16_GENIBUS);

/// Why an inbound byte sequence was rejected. `CrcMismatch` is reported
/// separately from the structural failures because the coordinator surfaces
/// it as an event; the rest are dropped silently.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Buffer too short to hold a frame")]
    TooShort,

    #[error("Frame is not delimited by flags")]
    MissingFlags,

    #[error("Invalid escape sequence")]
    Stuffing,

    #[error("Unstuffed frame shorter than header plus checksum")]
    PayloadTooShort,

    #[error("CRC mismatch: frame carries {expected:#06x}, computed {calculated:#06x}")]
    CrcMismatch { expected: u16, calculated: u16 },

    #[error("Unknown frame type {0:#04x}")]
    UnknownType(u8),
}

/// Escapes FLAG and ESC so the output never contains a bare FLAG.
pub fn stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    for &byte in data {
        if byte == FLAG || byte == ESC {
            out.push(ESC);
            out.push(byte ^ STUFF_XOR);
        } else {
            out.push(byte);
        }
    }
    out
}

/// Inverse of [`stuff`]. A bare FLAG, a trailing ESC, or an escape byte
/// other than `0x5d`/`0x5e` is a stuffing violation.
pub fn unstuff(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&byte) = iter.next() {
        match byte {
            FLAG => return Err(FrameError::Stuffing),
            ESC => {
                let &next = iter.next().ok_or(FrameError::Stuffing)?;
                let unstuffed = next ^ STUFF_XOR;
                if unstuffed != FLAG && unstuffed != ESC {
                    return Err(FrameError::Stuffing);
                }
                out.push(unstuffed);
            }
            _ => out.push(byte),
        }
    }
    Ok(out)
}

/// CRC-16-CCITT over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    FRAME_CRC.checksum(data)
}

/// `data` with its CRC appended big-endian.
pub fn append_crc(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    out.extend_from_slice(data);
    out.extend_from_slice(&crc16(data).to_be_bytes());
    out
}

/// Result of splitting a trailing CRC off a buffer and re-checking it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcCheck<'a> {
    pub valid: bool,
    pub data: &'a [u8],
    pub crc: u16,
    pub calculated: u16,
}

/// Splits the last two bytes of `buf` as a big-endian CRC and verifies the
/// rest against it.
pub fn extract_verify(buf: &[u8]) -> Result<CrcCheck<'_>, FrameError> {
    if buf.len() < 2 {
        return Err(FrameError::TooShort);
    }
    let (data, tail) = buf.split_at(buf.len() - 2);
    let crc = u16::from_be_bytes([tail[0], tail[1]]);
    let calculated = crc16(data);
    Ok(CrcCheck {
        valid: crc == calculated,
        data,
        crc,
        calculated,
    })
}

/// A parsed (or to-be-encoded) frame. The sequence number only uses the low
/// nibble; the high nibble is zero on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub seq: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, seq: u8, payload: Vec<u8>) -> Self {
        Frame {
            frame_type,
            seq: seq & 0x0f,
            payload,
        }
    }

    /// Builds the on-wire byte sequence. Payloads above [`MAX_DATA`] are a
    /// caller bug and fail before anything is emitted.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        if self.payload.len() > MAX_DATA {
            return Err(Error::PayloadTooLarge(self.payload.len()));
        }

        let mut inner = Vec::with_capacity(2 + self.payload.len() + 2);
        inner.push(self.frame_type.to_byte());
        inner.push(self.seq & 0x0f);
        inner.extend_from_slice(&self.payload);
        let inner = append_crc(&inner);

        let stuffed = stuff(&inner);
        let mut wire = Vec::with_capacity(stuffed.len() + 2);
        wire.push(FLAG);
        wire.extend_from_slice(&stuffed);
        wire.push(FLAG);
        Ok(wire)
    }

    /// Parses one complete frame. Error order mirrors the wire layout:
    /// length, flags, stuffing, inner length, CRC, then the control byte.
    pub fn decode(raw: &[u8]) -> Result<Frame, FrameError> {
        // Two flags plus at least the stuffed CONTROL/SEQ/CRC section.
        if raw.len() < 6 {
            return Err(FrameError::TooShort);
        }
        if raw[0] != FLAG || raw[raw.len() - 1] != FLAG {
            return Err(FrameError::MissingFlags);
        }

        let inner = unstuff(&raw[1..raw.len() - 1])?;
        if inner.len() < 4 {
            return Err(FrameError::PayloadTooShort);
        }

        let check = extract_verify(&inner)?;
        if !check.valid {
            return Err(FrameError::CrcMismatch {
                expected: check.crc,
                calculated: check.calculated,
            });
        }

        let frame_type =
            FrameType::from_byte(check.data[0]).ok_or(FrameError::UnknownType(check.data[0]))?;
        Ok(Frame {
            frame_type,
            seq: check.data[1] & 0x0f,
            payload: check.data[2..].to_vec(),
        })
    }
}

/// Splits a raw byte stream back into FLAG-delimited frames. The engine
/// consumes one frame per `rx` call; transports that deliver a continuous
/// stream (the demo binaries run over a TCP socket) use this to re-chunk it.
#[derive(Debug, Default)]
pub struct Deframer {
    buf: Vec<u8>,
    in_frame: bool,
}

impl Deframer {
    pub fn new() -> Self {
        Deframer::default()
    }

    /// Feeds raw bytes in; returns every complete frame they closed,
    /// delimiters included.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &byte in bytes {
            if !self.in_frame {
                if byte == FLAG {
                    self.in_frame = true;
                    self.buf.clear();
                    self.buf.push(FLAG);
                }
                continue;
            }

            self.buf.push(byte);
            if byte == FLAG {
                if self.buf.len() == 2 {
                    // Adjacent flags: the closing flag of one frame abuts the
                    // opening flag of the next. Stay in-frame, restart.
                    self.buf.clear();
                    self.buf.push(FLAG);
                } else {
                    frames.push(std::mem::take(&mut self.buf));
                    self.in_frame = false;
                }
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    #[test]
    fn stuffing_escapes_flag_and_esc() {
        assert_eq!(stuff(&[FLAG]), vec![ESC, 0x5e]);
        assert_eq!(stuff(&[ESC]), vec![ESC, 0x5d]);
        assert_eq!(stuff(&[0x42]), vec![0x42]);
    }

    #[test]
    fn stuffing_round_trip_random() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len = rng.gen_range(0..512);
            let mut data = vec![0u8; len];
            rng.fill_bytes(&mut data);

            let stuffed = stuff(&data);
            assert!(!stuffed.contains(&FLAG));
            assert!(stuffed.len() <= 2 * data.len().max(1));
            assert_eq!(unstuff(&stuffed).unwrap(), data);
        }
    }

    #[test]
    fn stuffing_worst_case_doubles() {
        let data = vec![FLAG; 64];
        assert_eq!(stuff(&data).len(), 128);
    }

    #[test]
    fn unstuff_rejects_bad_input() {
        assert_eq!(unstuff(&[FLAG]), Err(FrameError::Stuffing));
        assert_eq!(unstuff(&[ESC]), Err(FrameError::Stuffing));
        assert_eq!(unstuff(&[ESC, 0x00]), Err(FrameError::Stuffing));
        assert_eq!(unstuff(&[0x01, ESC]), Err(FrameError::Stuffing));
    }

    #[test]
    fn crc_known_vector() {
        // CRC-16/GENIBUS check value for "123456789".
        assert_eq!(crc16(b"123456789"), 0xd64e);
    }

    #[test]
    fn crc_append_extract_round_trip() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len = rng.gen_range(0..256);
            let mut data = vec![0u8; len];
            rng.fill_bytes(&mut data);

            let buf = append_crc(&data);
            let check = extract_verify(&buf).unwrap();
            assert!(check.valid);
            assert_eq!(check.data, &data[..]);
            assert_eq!(check.crc, check.calculated);
        }
    }

    #[test]
    fn crc_detects_corruption() {
        let mut buf = append_crc(b"some payload");
        buf[3] ^= 0x10;
        let check = extract_verify(&buf).unwrap();
        assert!(!check.valid);
    }

    #[test]
    fn extract_verify_needs_two_bytes() {
        assert_eq!(extract_verify(&[0xab]), Err(FrameError::TooShort));
    }

    #[test]
    fn frame_round_trip_all_types() {
        let types = [
            FrameType::Data,
            FrameType::Ack,
            FrameType::Nak,
            FrameType::Conn,
            FrameType::ConnAck,
            FrameType::Disc,
            FrameType::DiscAck,
            FrameType::Heartbeat,
        ];
        let mut rng = rand::thread_rng();
        for frame_type in types {
            for _ in 0..20 {
                let seq = rng.gen_range(0..16);
                let len = rng.gen_range(0..MAX_DATA);
                let mut payload = vec![0u8; len];
                rng.fill_bytes(&mut payload);

                let frame = Frame::new(frame_type, seq, payload.clone());
                let wire = frame.encode().unwrap();
                let parsed = Frame::decode(&wire).unwrap();
                assert_eq!(parsed.frame_type, frame_type);
                assert_eq!(parsed.seq, seq);
                assert_eq!(parsed.payload, payload);
            }
        }
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let frame = Frame::new(FrameType::Data, 0, vec![0u8; MAX_DATA + 1]);
        assert!(matches!(frame.encode(), Err(Error::PayloadTooLarge(_))));
    }

    #[test]
    fn decode_rejects_malformed_input() {
        assert_eq!(Frame::decode(&[FLAG, FLAG]), Err(FrameError::TooShort));
        assert_eq!(
            Frame::decode(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]),
            Err(FrameError::MissingFlags)
        );

        // A valid DATA frame with its inner escape broken.
        let wire = Frame::new(FrameType::Data, 1, vec![FLAG]).encode().unwrap();
        let mut broken = wire.clone();
        broken[3] = 0x00; // was an escaped byte
        assert!(matches!(
            Frame::decode(&broken),
            Err(FrameError::Stuffing) | Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn decode_reports_crc_mismatch_distinctly() {
        let mut wire = Frame::new(FrameType::Data, 3, b"hola".to_vec())
            .encode()
            .unwrap();
        // Flip a payload bit; stays structurally valid.
        wire[4] ^= 0x01;
        assert!(matches!(
            Frame::decode(&wire),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let inner = append_crc(&[0x09, 0x00]);
        let mut wire = vec![FLAG];
        wire.extend_from_slice(&stuff(&inner));
        wire.push(FLAG);
        assert_eq!(Frame::decode(&wire), Err(FrameError::UnknownType(0x09)));
    }

    #[test]
    fn single_bit_flips_never_yield_a_different_frame() {
        let mut rng = rand::thread_rng();
        let frame = Frame::new(FrameType::Data, 5, b"payload bytes".to_vec());
        let wire = frame.encode().unwrap();

        for _ in 0..500 {
            let mut flipped = wire.clone();
            let byte = rng.gen_range(0..flipped.len());
            let bit = rng.gen_range(0..8);
            flipped[byte] ^= 1 << bit;

            match Frame::decode(&flipped) {
                Ok(parsed) => assert_eq!(parsed, frame),
                Err(_) => {}
            }
        }
    }

    #[test]
    fn deframer_splits_concatenated_frames() {
        let a = Frame::new(FrameType::Data, 0, b"one".to_vec()).encode().unwrap();
        let b = Frame::new(FrameType::Ack, 1, Vec::new()).encode().unwrap();

        let mut stream = Vec::new();
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);

        let mut deframer = Deframer::new();
        // Feed in awkward chunk sizes.
        let mut frames = Vec::new();
        for chunk in stream.chunks(3) {
            frames.extend(deframer.push(chunk));
        }
        assert_eq!(frames, vec![a, b]);
    }

    #[test]
    fn deframer_skips_leading_noise() {
        let frame = Frame::new(FrameType::Heartbeat, 0, b"12345".to_vec())
            .encode()
            .unwrap();
        let mut stream = vec![0x11, 0x22, 0x33];
        stream.extend_from_slice(&frame);

        let mut deframer = Deframer::new();
        let frames = deframer.push(&stream);
        assert_eq!(frames, vec![frame]);
    }
}
