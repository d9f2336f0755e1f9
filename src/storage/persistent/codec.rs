//! Record framing for the step log file.
//!
//! ```text
//! file:  [b"TRJL"][format: u8] frame*
//! frame: [payload_len: u32 LE][crc32(payload_len ++ payload): u32 LE][payload: JSON]
//! ```
//!
//! The checksum covers the length prefix, so a torn length is caught as
//! corruption instead of sending the reader off to a random offset.

use std::io::{self, Read, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// On-disk format revision, stored once in the file header.
pub const FORMAT: u8 = 1;

const MAGIC: [u8; 4] = *b"TRJL";

pub const HEADER_LEN: u64 = 5;

/// Length prefix plus checksum.
const FRAME_OVERHEAD: usize = 8;

/// Largest accepted payload.
const MAX_PAYLOAD: usize = 16 << 20;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The input ended inside a frame or header.
    #[error("truncated frame")]
    Truncated,
    #[error("corrupt frame: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(e)
        }
    }
}

fn checksum(len_bytes: [u8; 4], payload: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(&len_bytes);
    h.update(payload);
    h.finalize()
}

/// Frames one value.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(value).map_err(|e| FrameError::Corrupt(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|_| payload.len() <= MAX_PAYLOAD)
        .ok_or_else(|| FrameError::Corrupt(format!("payload of {} bytes is too large", payload.len())))?;
    let len_bytes = len.to_le_bytes();

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.extend_from_slice(&len_bytes);
    frame.extend_from_slice(&checksum(len_bytes, &payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads one frame, returning the value and the frame's size in bytes.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> Result<(T, u64), FrameError> {
    let mut head = [0u8; FRAME_OVERHEAD];
    reader.read_exact(&mut head)?;
    let [l0, l1, l2, l3, c0, c1, c2, c3] = head;
    let len_bytes = [l0, l1, l2, l3];
    let stored = u32::from_le_bytes([c0, c1, c2, c3]);

    let len = usize::try_from(u32::from_le_bytes(len_bytes)).unwrap_or(usize::MAX);
    if len > MAX_PAYLOAD {
        return Err(FrameError::Corrupt(format!("declared payload of {len} bytes")));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    if checksum(len_bytes, &payload) != stored {
        return Err(FrameError::Corrupt("checksum mismatch".to_string()));
    }
    let value = serde_json::from_slice(&payload).map_err(|e| FrameError::Corrupt(e.to_string()))?;
    Ok((value, (FRAME_OVERHEAD + len) as u64))
}

pub fn write_header(writer: &mut impl Write) -> io::Result<()> {
    let mut header = [0u8; 5];
    header[..4].copy_from_slice(&MAGIC);
    header[4] = FORMAT;
    writer.write_all(&header)
}

/// Checks the file header; files from another format revision are refused.
pub fn read_header(reader: &mut impl Read) -> Result<(), FrameError> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if header[..4] != MAGIC {
        return Err(FrameError::Corrupt("not a trajlog file".to_string()));
    }
    if header[4] != FORMAT {
        return Err(FrameError::Corrupt(format!("unsupported format revision {}", header[4])));
    }
    Ok(())
}
