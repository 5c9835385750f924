//! Wire protocol for the compile daemon.
//!
//! Every message, request or response, is a single frame: eight ASCII decimal
//! digits holding the payload length (zero padded, no sign) followed by exactly
//! that many payload bytes. There is no version field and no status field; an
//! error response is just a short decimal string in the payload.
//!
//! ```text
//! 00000005%PDF1
//! └──────┘└───┘
//!  header  payload
//! ```

use std::io::{self, Read, Write};

use thiserror::Error;

/// Width of the decimal length header in bytes.
pub const HEADER_WIDTH: usize = 8;

/// Largest payload the eight digit header can describe.
pub const MAX_PAYLOAD_LEN: usize = 99_999_999;

/// Chunk size used while draining a payload from the socket.
pub const READ_CHUNK: usize = 1024;

/// Errors raised while encoding or decoding frames.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("malformed frame header: {header:?}")]
    Malformed { header: String },

    #[error("payload of {len} bytes exceeds the 99999999 byte frame limit")]
    TooLarge { len: usize },

    #[error("frame i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    fn malformed(bytes: &[u8]) -> Self {
        FrameError::Malformed {
            header: String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// Encode a payload into a complete frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::TooLarge { len: payload.len() });
    }
    let mut buf = Vec::with_capacity(HEADER_WIDTH + payload.len());
    buf.extend_from_slice(format!("{:0width$}", payload.len(), width = HEADER_WIDTH).as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Parse a length header. Only exactly eight ASCII digits are accepted.
pub fn parse_header(header: &[u8]) -> Result<usize, FrameError> {
    if header.len() != HEADER_WIDTH || !header.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::malformed(header));
    }
    // Eight digits always fit in a usize.
    Ok(header
        .iter()
        .fold(0usize, |acc, b| acc * 10 + usize::from(b - b'0')))
}

/// Read and parse the length header, consuming exactly [`HEADER_WIDTH`] bytes.
///
/// A stream that ends inside the header is reported as malformed.
pub fn read_header<R: Read>(reader: &mut R) -> Result<usize, FrameError> {
    let mut header = [0u8; HEADER_WIDTH];
    let mut filled = 0;
    while filled < HEADER_WIDTH {
        match reader.read(&mut header[filled..]) {
            Ok(0) => return Err(FrameError::malformed(&header[..filled])),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    parse_header(&header)
}

/// Read up to `len` payload bytes in [`READ_CHUNK`] sized reads.
///
/// If the peer closes the stream early the bytes collected so far are
/// returned; callers compare the length against `len` to detect a short read.
pub fn read_payload<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>, FrameError> {
    let mut payload = Vec::with_capacity(len.min(64 * READ_CHUNK));
    let mut chunk = [0u8; READ_CHUNK];
    while payload.len() < len {
        let want = (len - payload.len()).min(READ_CHUNK);
        match reader.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(n) => payload.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(payload)
}

/// Read one frame. Returns the declared length alongside the payload so
/// short reads are visible to the caller.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<(usize, Vec<u8>), FrameError> {
    let declared = read_header(reader)?;
    let payload = read_payload(reader, declared)?;
    Ok((declared, payload))
}

/// Encode `payload` and write the whole frame, flushing before returning.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<usize, FrameError> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(frame.len())
}
