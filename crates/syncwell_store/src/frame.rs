//! Log framing.
//!
//! Every record in a log file is wrapped in a frame:
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (length) | crc32 (4) |
//! ```
//!
//! Integers are little-endian. The CRC covers the header and the payload.
//! A frame cut short at the end of the log is a torn write and is
//! dropped on open; any other malformed frame is corruption.

use crate::error::{StoreError, StoreResult};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"SWLG";

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

/// Bytes before the payload.
pub const HEADER_SIZE: usize = 4 + 2 + 1 + 4;

/// Bytes after the payload.
pub const TRAILER_SIZE: usize = 4;

/// Kind of change a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Insert or replace a row. Payload is the encoded row.
    Upsert = 1,
    /// Remove a row. Payload is the encoded key.
    Remove = 2,
}

impl FrameType {
    /// Converts a byte to a frame type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Upsert),
            2 => Some(Self::Remove),
            _ => None,
        }
    }

    /// Converts the frame type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Offset of the frame in the log.
    pub offset: u64,
    /// Frame type.
    pub frame_type: FrameType,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// Result of scanning a log.
#[derive(Debug, Default)]
pub struct Scan {
    /// Complete, checksummed frames in log order.
    pub frames: Vec<Frame>,
    /// Length of the log prefix holding complete frames.
    pub valid_len: u64,
    /// Bytes after `valid_len` belonging to a torn frame.
    pub torn_bytes: u64,
}

/// Encodes one frame.
pub fn encode_frame(frame_type: FrameType, payload: &[u8]) -> StoreResult<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        StoreError::InvalidArgument(format!("frame payload too large: {} bytes", payload.len()))
    })?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    buf.push(frame_type.as_byte());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Scans a whole log.
///
/// Returns every complete frame. A truncated frame at the end is reported
/// through [`Scan::torn_bytes`]; bad magic, an unknown version or type, or
/// a checksum mismatch is an error.
pub fn scan(data: &[u8]) -> StoreResult<Scan> {
    let mut out = Scan::default();
    let mut pos = 0usize;

    while pos < data.len() {
        let offset = pos as u64;
        let rest = &data[pos..];

        if rest.len() < HEADER_SIZE {
            out.torn_bytes = rest.len() as u64;
            break;
        }
        if rest[0..4] != FRAME_MAGIC {
            return Err(StoreError::corrupted(offset, "bad frame magic"));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version != FRAME_VERSION {
            return Err(StoreError::corrupted(
                offset,
                format!("unsupported frame version {version}"),
            ));
        }
        let frame_type = FrameType::from_byte(rest[6])
            .ok_or_else(|| StoreError::corrupted(offset, format!("unknown frame type {}", rest[6])))?;
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;

        let total = HEADER_SIZE + len + TRAILER_SIZE;
        if rest.len() < total {
            out.torn_bytes = rest.len() as u64;
            break;
        }

        let body_end = HEADER_SIZE + len;
        let stored = u32::from_le_bytes([
            rest[body_end],
            rest[body_end + 1],
            rest[body_end + 2],
            rest[body_end + 3],
        ]);
        let computed = compute_crc32(&rest[..body_end]);
        if stored != computed {
            return Err(StoreError::corrupted(
                offset,
                format!("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"),
            ));
        }

        out.frames.push(Frame {
            offset,
            frame_type,
            payload: rest[HEADER_SIZE..body_end].to_vec(),
        });
        pos += total;
        out.valid_len = pos as u64;
    }

    Ok(out)
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(frames: &[(FrameType, &[u8])]) -> Vec<u8> {
        frames
            .iter()
            .flat_map(|(t, p)| encode_frame(*t, p).unwrap())
            .collect()
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn scans_frames_in_order() {
        let data = log_of(&[(FrameType::Upsert, b"one"), (FrameType::Remove, b"two")]);
        let scan = scan(&data).unwrap();

        assert_eq!(scan.frames.len(), 2);
        assert_eq!(scan.frames[0].offset, 0);
        assert_eq!(scan.frames[0].payload, b"one");
        assert_eq!(scan.frames[1].frame_type, FrameType::Remove);
        assert_eq!(scan.frames[1].offset, (HEADER_SIZE + 3 + TRAILER_SIZE) as u64);
        assert_eq!(scan.valid_len, data.len() as u64);
        assert_eq!(scan.torn_bytes, 0);
    }

    #[test]
    fn torn_tail_is_reported_not_fatal() {
        let mut data = log_of(&[(FrameType::Upsert, b"complete")]);
        let whole = data.len() as u64;
        let partial = encode_frame(FrameType::Upsert, b"cut short").unwrap();
        data.extend_from_slice(&partial[..partial.len() - 3]);

        let scan = scan(&data).unwrap();
        assert_eq!(scan.frames.len(), 1);
        assert_eq!(scan.valid_len, whole);
        assert_eq!(scan.torn_bytes, (partial.len() - 3) as u64);
    }

    #[test]
    fn torn_header_is_reported() {
        let mut data = log_of(&[(FrameType::Upsert, b"x")]);
        data.extend_from_slice(&FRAME_MAGIC[..3]);
        let scan = scan(&data).unwrap();
        assert_eq!(scan.frames.len(), 1);
        assert_eq!(scan.torn_bytes, 3);
    }

    #[test]
    fn flipped_bit_is_corruption() {
        let mut data = log_of(&[(FrameType::Upsert, b"payload"), (FrameType::Upsert, b"next")]);
        data[HEADER_SIZE + 2] ^= 0x40;
        let err = scan(&data).unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { offset: 0, .. }));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut data = log_of(&[(FrameType::Upsert, b"a")]);
        data[0] = b'X';
        assert!(matches!(scan(&data), Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn empty_log_scans_clean() {
        let scan = scan(&[]).unwrap();
        assert!(scan.frames.is_empty());
        assert_eq!(scan.valid_len, 0);
    }
}
