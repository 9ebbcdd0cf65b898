//! Stream framing: a 4-byte big-endian length followed by that many payload bytes.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

pub const HEADER_LEN: usize = 4;

#[derive(Debug, PartialEq, Eq)]
pub enum FrameRead {
    Frame(Vec<u8>),
    /// Peer closed cleanly between frames.
    Closed,
    /// Peer closed (or we were stopped) inside a frame; the partial bytes are discarded.
    Truncated { expected: usize, received: usize },
}

/// Reads one frame, looping over short reads. Read timeouts are retried until
/// `stop` is raised, so a socket with a read timeout can still be shut down.
pub fn read_frame<R: Read>(reader: &mut R, max_len: u32, stop: &AtomicBool) -> io::Result<FrameRead> {
    let mut header = [0u8; HEADER_LEN];
    let got = read_full(reader, &mut header, stop)?;
    if got == 0 {
        return Ok(FrameRead::Closed);
    }
    if got < HEADER_LEN {
        return Ok(FrameRead::Truncated {
            expected: HEADER_LEN,
            received: got,
        });
    }

    let declared = u32::from_be_bytes(header);
    if declared > max_len {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame length {} exceeds limit {}", declared, max_len),
        ));
    }
    let expected = declared as usize;
    let mut payload = vec![0u8; expected];
    let received = read_full(reader, &mut payload, stop)?;
    if received < expected {
        return Ok(FrameRead::Truncated { expected, received });
    }
    Ok(FrameRead::Frame(payload))
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "payload longer than u32::MAX"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

// Fills `buf` unless EOF or stop intervenes; returns how many bytes landed.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8], stop: &AtomicBool) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
