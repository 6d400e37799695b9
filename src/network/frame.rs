// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire frame codec.
//!
//! ```text
//! +----------------+-----+------+----------------+-----------------+------+
//! | total_len: u16 | seq | code | command_len:u16| payload ...     | crc8 |
//! +----------------+-----+------+----------------+-----------------+------+
//! ```
//!
//! All 16-bit fields are big-endian. `total_len` covers the whole frame, header and trailer
//! included, so it always equals `command_len + 7`. The checksum runs from `seq` up to the
//! last payload byte.

use bytes::{BufMut, BytesMut};

use crate::AppError::{self, Incomplete};
use crate::AppResult;

/// total length, sequence number, command code and command length
pub const FRAME_HEADER_LEN: usize = 6;
/// header plus the trailing checksum
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_LEN + 1;
/// first byte covered by the checksum
const CRC_START: usize = 2;

const CRC8_POLY: u8 = 0x07;
const CRC8_INIT: u8 = 0xFF;

static CRC8_TABLE: [u8; 256] = crc8_table();

const fn crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC8_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Running CRC8 accumulator (polynomial 0x07, seeded with 0xFF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc8(u8);

impl Crc8 {
    pub fn new() -> Self {
        Crc8(CRC8_INIT)
    }

    pub fn add_byte(&mut self, byte: u8) {
        self.0 = CRC8_TABLE[(self.0 ^ byte) as usize];
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.add_byte(*byte);
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn checksum(bytes: &[u8]) -> u8 {
        let mut crc = Crc8::new();
        crc.add_bytes(bytes);
        crc.value()
    }
}

impl Default for Crc8 {
    fn default() -> Self {
        Crc8::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub total_length: u16,
    pub seq: u8,
    pub code: u8,
    pub command_length: u16,
}

/// A complete frame borrowed from a receive buffer.
#[derive(Debug)]
pub struct Frame<'a> {
    pub header: FrameHeader,
    pub payload: &'a [u8],
    pub crc: u8,
    covered: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Checks whether `buffer` starts with a whole frame and returns its total length.
    ///
    /// `Incomplete` is returned while fewer bytes than the declared total length have
    /// arrived, the caller keeps the bytes and tries again once more data is buffered.
    pub fn check(buffer: &[u8], max_frame_size: usize) -> AppResult<usize> {
        if buffer.len() < 2 {
            return Err(Incomplete);
        }
        let total = u16::from_be_bytes([buffer[0], buffer[1]]) as usize;
        if total > max_frame_size {
            return Err(AppError::FrameTooLarge {
                length: total,
                max: max_frame_size,
            });
        }
        if buffer.len() < total {
            return Err(Incomplete);
        }
        Ok(total)
    }

    /// Decodes the frame at the start of `buffer`, `None` when more data is needed.
    ///
    /// Trailing bytes past the first frame are ignored. The checksum is not verified
    /// here, see [`Frame::validate`].
    pub fn parse(buffer: &'a [u8], max_frame_size: usize) -> AppResult<Option<Frame<'a>>> {
        let total = match Frame::check(buffer, max_frame_size) {
            Ok(total) => total,
            Err(Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };
        Frame::parse_complete(&buffer[..total]).map(Some)
    }

    /// Decodes a buffer that holds exactly one frame.
    pub(crate) fn parse_complete(frame: &'a [u8]) -> AppResult<Frame<'a>> {
        let total = frame.len();
        if total < FRAME_OVERHEAD {
            return Err(AppError::FrameLengthMismatch {
                total,
                command: 0,
            });
        }
        let command_length = u16::from_be_bytes([frame[4], frame[5]]);
        if total != command_length as usize + FRAME_OVERHEAD {
            return Err(AppError::FrameLengthMismatch {
                total,
                command: command_length as usize,
            });
        }
        let header = FrameHeader {
            total_length: total as u16,
            seq: frame[2],
            code: frame[3],
            command_length,
        };
        Ok(Frame {
            header,
            payload: &frame[FRAME_HEADER_LEN..total - 1],
            crc: frame[total - 1],
            covered: &frame[CRC_START..total - 1],
        })
    }

    /// Recomputes the checksum over sequence number, code, length and payload.
    pub fn validate(&self) -> AppResult<()> {
        let expected = Crc8::checksum(self.covered);
        if expected != self.crc {
            return Err(AppError::ChecksumInvalid {
                expected,
                found: self.crc,
            });
        }
        Ok(())
    }
}

/// Appends one encoded frame to `buffer`.
pub fn encode_frame(buffer: &mut BytesMut, seq: u8, code: u8, payload: &[u8]) -> AppResult<()> {
    let total = payload.len() + FRAME_OVERHEAD;
    if total > u16::MAX as usize {
        return Err(AppError::FrameTooLarge {
            length: total,
            max: u16::MAX as usize,
        });
    }
    let start = buffer.len();
    buffer.reserve(total);
    buffer.put_u16(total as u16);
    buffer.put_u8(seq);
    buffer.put_u8(code);
    buffer.put_u16(payload.len() as u16);
    buffer.put_slice(payload);
    let crc = Crc8::checksum(&buffer[start + CRC_START..]);
    buffer.put_u8(crc);
    Ok(())
}

/// Frames a payload that already sits at offset [`FRAME_HEADER_LEN`] of `buffer`.
///
/// Writes the header in front of it and the checksum behind it, and returns the total
/// frame length. The caller guarantees `buffer` holds `payload_len + FRAME_OVERHEAD` bytes.
pub(crate) fn encode_frame_in_place(buffer: &mut [u8], seq: u8, code: u8, payload_len: usize) -> usize {
    let total = payload_len + FRAME_OVERHEAD;
    buffer[0..2].copy_from_slice(&(total as u16).to_be_bytes());
    buffer[2] = seq;
    buffer[3] = code;
    buffer[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    let crc = Crc8::checksum(&buffer[CRC_START..total - 1]);
    buffer[total - 1] = crc;
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc8_known_values() {
        // CRC-8 with poly 0x07 and init 0xFF
        assert_eq!(Crc8::checksum(&[]), 0xFF);
        assert_eq!(Crc8::checksum(&[0x00]), CRC8_TABLE[0xFF]);
        let mut crc = Crc8::new();
        crc.add_byte(0x05);
        crc.add_byte(0x10);
        assert_eq!(crc.value(), Crc8::checksum(&[0x05, 0x10]));
    }

    #[test]
    fn test_check_incomplete() {
        assert!(matches!(Frame::check(&[0x00], 64), Err(Incomplete)));
        assert!(matches!(Frame::check(&[0x00, 0x09, 0x05], 64), Err(Incomplete)));
    }

    #[test]
    fn test_check_too_large() {
        assert!(matches!(
            Frame::check(&[0x01, 0x00], 64),
            Err(AppError::FrameTooLarge { length: 256, max: 64 })
        ));
    }

    #[test]
    fn test_in_place_matches_appended() {
        let payload = [0xAA, 0xBB, 0xCC];
        let mut appended = BytesMut::new();
        encode_frame(&mut appended, 9, 0x00, &payload).unwrap();

        let mut in_place = [0u8; 16];
        in_place[FRAME_HEADER_LEN..FRAME_HEADER_LEN + 3].copy_from_slice(&payload);
        let total = encode_frame_in_place(&mut in_place, 9, 0x00, payload.len());
        assert_eq!(&in_place[..total], &appended[..]);
    }

    #[test]
    fn test_short_total_length_is_mismatch() {
        let buffer = [0x00, 0x03, 0x01];
        assert!(matches!(
            Frame::parse(&buffer, 64),
            Err(AppError::FrameLengthMismatch { total: 3, .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut buffer = BytesMut::new();
        encode_frame(&mut buffer, 1, 0x20, &[7]).unwrap();
        buffer.put_slice(&[0xde, 0xad]);
        let frame = Frame::parse(&buffer, 64).unwrap().unwrap();
        assert_eq!(frame.payload, &[7]);
        assert!(frame.validate().is_ok());
    }
}
