//! Journal frame layout and checksums.
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! Integers are little-endian. The CRC covers header and payload.

use crate::error::{CoreError, CoreResult};

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
pub const HEADER_SIZE: usize = 11;

/// CRC size.
pub const CRC_SIZE: usize = 4;

/// One decoded journal frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind; its meaning belongs to the journal's owner.
    pub kind: u8,
    /// Frame payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame.
    pub fn new(kind: u8, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Encodes the frame with the given magic.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the payload does not fit a 4-byte length.
    pub fn encode(&self, magic: [u8; 4]) -> CoreResult<Vec<u8>> {
        let len = u32::try_from(self.payload.len()).map_err(|_| {
            CoreError::invalid_argument(format!(
                "frame payload too large: {} bytes",
                self.payload.len()
            ))
        })?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len() + CRC_SIZE);
        buf.extend_from_slice(&magic);
        buf.extend_from_slice(&FRAME_VERSION.to_le_bytes());
        buf.push(self.kind);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }
}

/// Result of decoding a journal image.
#[derive(Debug, Default)]
pub struct DecodedFrames {
    /// Frames in file order.
    pub frames: Vec<Frame>,
    /// Length of the prefix made of complete, valid frames.
    pub valid_len: u64,
    /// Bytes after the last complete frame (a write cut short by a crash).
    pub torn_bytes: u64,
}

/// Decodes every frame in `data`.
///
/// A trailing frame that is cut short is not an error: its bytes are
/// reported in `torn_bytes`. Anything else that is wrong is.
///
/// # Errors
///
/// Returns `JournalCorruption` for a bad magic or unknown version, and
/// `ChecksumMismatch` for a complete frame whose CRC does not match.
pub fn decode_frames(data: &[u8], magic: [u8; 4]) -> CoreResult<DecodedFrames> {
    let mut frames = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < HEADER_SIZE {
            break;
        }

        if rest[0..4] != magic {
            return Err(CoreError::journal_corruption(format!(
                "bad frame magic at offset {offset}"
            )));
        }

        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version != FRAME_VERSION {
            return Err(CoreError::journal_corruption(format!(
                "unsupported frame version {version} at offset {offset}"
            )));
        }

        let kind = rest[6];
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            break;
        }

        let body_end = HEADER_SIZE + len;
        let expected = u32::from_le_bytes([
            rest[body_end],
            rest[body_end + 1],
            rest[body_end + 2],
            rest[body_end + 3],
        ]);
        let actual = compute_crc32(&rest[..body_end]);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch {
                offset: offset as u64,
                expected,
                actual,
            });
        }

        frames.push(Frame::new(kind, rest[HEADER_SIZE..body_end].to_vec()));
        offset += total;
    }

    Ok(DecodedFrames {
        frames,
        valid_len: offset as u64,
        torn_bytes: (data.len() - offset) as u64,
    })
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, reflected
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
