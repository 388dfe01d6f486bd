//! Framed JSON codec — length-prefixed messages for the instrument stream
//! and the basecaller IPC socket.
//!
//! Frame layout: `[len: u32 LE][payload: len bytes of JSON]`. A frame length
//! above [`MAX_FRAME_BYTES`] is rejected before any allocation happens.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Upper bound on a single frame. A full PromethION chunk batch is a few
/// megabytes; anything near this limit is a corrupt length prefix.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Write one framed message.
pub fn write_frame<W: Write, T: Serialize + ?Sized>(writer: &mut W, msg: &T) -> io::Result<()> {
    let payload = serde_json::to_vec(msg)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()
}

/// Read one framed message. `Ok(None)` when the peer closed the stream
/// cleanly between frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit {MAX_FRAME_BYTES}"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    let msg = serde_json::from_slice(&payload)?;
    Ok(Some(msg))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
