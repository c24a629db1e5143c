//! Length-prefixed frame codec over a blocking byte stream.
//!
//! On the wire a frame is `LE32(N)` followed by `N` opaque bytes. The codec
//! neither encrypts nor interprets the payload; it only guarantees exact
//! framing. Reads are chunked and short reads concatenate until the declared
//! length is reached. Nothing is buffered across frames, so the same stream
//! can be handed to the handshake line reader between frames.

use std::io::{self, Read, Write};

use crate::error::{ChannelError, Result};

/// Bytes occupied by the length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Chunk size for body reads.
pub const READ_CHUNK_SIZE: usize = 512;

/// Upper bound for a handshake line, generous for any RSA size in use.
const MAX_LINE_BYTES: usize = 64 * 1024;

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Writes frames to a byte sink.
pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Emit `LE32(len) ∥ payload` and flush.
    ///
    /// Returns the number of bytes put on the wire (`4 + payload.len()`).
    ///
    /// # Errors
    /// Propagates any underlying I/O error.
    pub fn write_frame(&mut self, payload: &[u8]) -> Result<usize> {
        let len = u32::try_from(payload.len())
            .map_err(|_| ChannelError::Config("frame payload exceeds u32 length".into()))?;
        self.inner.write_all(&len.to_le_bytes())?;
        self.inner.write_all(payload)?;
        self.inner.flush()?;
        Ok(LENGTH_PREFIX_BYTES + payload.len())
    }

    /// Write a handshake line: the text followed by a single line feed.
    pub fn write_line(&mut self, text: &str) -> Result<usize> {
        self.inner.write_all(text.as_bytes())?;
        self.inner.write_all(b"\n")?;
        self.inner.flush()?;
        Ok(text.len() + 1)
    }

    /// Access the underlying sink.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

/// Reads frames from a byte source.
pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one complete frame payload.
    ///
    /// Reads exactly 4 bytes of length, then the body in chunks of
    /// [`READ_CHUNK_SIZE`], concatenating short reads until the declared
    /// length is reached.
    ///
    /// # Errors
    /// - `ChannelError::Timeout` when the source times out before any byte
    ///   of the frame arrived (recoverable; try again later).
    /// - `ChannelError::ConnectionClosed` on EOF at a frame boundary.
    /// - `ChannelError::FrameUnderflow` on EOF mid-frame (fatal).
    ///
    /// A timeout after partial progress keeps reading: the frame boundary
    /// must not be lost once bytes of it were consumed.
    pub fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
        self.fill(&mut len_buf, true)?;
        let expected = u32::from_le_bytes(len_buf) as usize;

        let mut payload = vec![0u8; expected];
        let mut filled = 0;
        while filled < expected {
            let want = READ_CHUNK_SIZE.min(expected - filled);
            match self.inner.read(&mut payload[filled..filled + want]) {
                Ok(0) => {
                    return Err(ChannelError::FrameUnderflow {
                        got: filled,
                        expected,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(payload)
    }

    /// Read bytes up to a line feed, stripping the terminator.
    ///
    /// A trailing carriage return is also stripped, so peers writing CRLF
    /// are tolerated. Reads one byte at a time and never consumes past the
    /// line feed.
    pub fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => {
                    return if line.is_empty() {
                        Err(ChannelError::ConnectionClosed)
                    } else {
                        Err(ChannelError::FrameUnderflow {
                            got: line.len(),
                            expected: line.len() + 1,
                        })
                    }
                }
                Ok(_) => {
                    if byte[0] == b'\n' {
                        if line.last() == Some(&b'\r') {
                            line.pop();
                        }
                        return Ok(line);
                    }
                    if line.len() >= MAX_LINE_BYTES {
                        return Err(ChannelError::Handshake(
                            crate::error::constants::ERR_LINE_TOO_LONG.into(),
                        ));
                    }
                    line.push(byte[0]);
                }
                Err(e) if is_timeout(&e) => {
                    if line.is_empty() {
                        return Err(ChannelError::Timeout);
                    }
                    // Mid-line timeout: keep waiting for the terminator.
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Access the underlying source.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    // Read exactly buf.len() bytes. With `boundary` set, EOF or timeout
    // before the first byte reports ConnectionClosed/Timeout instead of
    // underflow, since no frame was started yet.
    fn fill(&mut self, buf: &mut [u8], boundary: bool) -> Result<()> {
        let expected = buf.len();
        let mut filled = 0;
        while filled < expected {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => {
                    return if boundary && filled == 0 {
                        Err(ChannelError::ConnectionClosed)
                    } else {
                        Err(ChannelError::FrameUnderflow {
                            got: filled,
                            expected,
                        })
                    }
                }
                Ok(n) => filled += n,
                Err(e) if is_timeout(&e) => {
                    if boundary && filled == 0 {
                        return Err(ChannelError::Timeout);
                    }
                    // Partial prefix: keep reading, the boundary is committed.
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_round_trip() {
        let mut wire = Vec::new();
        let payload = vec![0xAB; 1500];
        let written = FrameWriter::new(&mut wire).write_frame(&payload).unwrap();
        assert_eq!(written, 4 + 1500);
        assert_eq!(wire.len(), written);
        assert_eq!(u32::from_le_bytes(wire[..4].try_into().unwrap()), 1500);

        let mut reader = FrameReader::new(Cursor::new(wire));
        assert_eq!(reader.read_frame().unwrap(), payload);
    }

    #[test]
    fn test_empty_frame() {
        let mut wire = Vec::new();
        let written = FrameWriter::new(&mut wire).write_frame(&[]).unwrap();
        assert_eq!(written, 4);

        let mut reader = FrameReader::new(Cursor::new(wire));
        assert!(reader.read_frame().unwrap().is_empty());
    }

    #[test]
    fn test_consecutive_frames_not_buffered() {
        let mut wire = Vec::new();
        {
            let mut w = FrameWriter::new(&mut wire);
            w.write_frame(b"first").unwrap();
            w.write_frame(b"second").unwrap();
        }
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert_eq!(reader.read_frame().unwrap(), b"first");
        assert_eq!(reader.read_frame().unwrap(), b"second");
    }

    #[test]
    fn test_eof_at_boundary_is_closed() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()));
        assert!(matches!(
            reader.read_frame(),
            Err(ChannelError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_underflow_mid_body_is_fatal() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&100u32.to_le_bytes());
        wire.extend_from_slice(&[0u8; 40]); // 60 bytes short
        let mut reader = FrameReader::new(Cursor::new(wire));
        match reader.read_frame() {
            Err(ChannelError::FrameUnderflow { got, expected }) => {
                assert_eq!(got, 40);
                assert_eq!(expected, 100);
            }
            other => panic!("expected underflow, got {other:?}"),
        }
    }

    #[test]
    fn test_underflow_mid_prefix_is_fatal() {
        let mut reader = FrameReader::new(Cursor::new(vec![0x01, 0x02]));
        assert!(matches!(
            reader.read_frame(),
            Err(ChannelError::FrameUnderflow { .. })
        ));
    }

    #[test]
    fn test_body_larger_than_chunk() {
        let payload: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        let mut wire = Vec::new();
        FrameWriter::new(&mut wire).write_frame(&payload).unwrap();
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert_eq!(reader.read_frame().unwrap(), payload);
    }

    #[test]
    fn test_line_lf() {
        let mut reader = FrameReader::new(Cursor::new(b"aGVsbG8=\nrest".to_vec()));
        assert_eq!(reader.read_line().unwrap(), b"aGVsbG8=");
        // The byte after the terminator is untouched.
        let mut rest = Vec::new();
        reader.get_mut().read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"rest");
    }

    #[test]
    fn test_line_crlf_tolerated() {
        let mut reader = FrameReader::new(Cursor::new(b"aGVsbG8=\r\n".to_vec()));
        assert_eq!(reader.read_line().unwrap(), b"aGVsbG8=");
    }

    #[test]
    fn test_write_line_is_lf_terminated() {
        let mut wire = Vec::new();
        FrameWriter::new(&mut wire).write_line("abc").unwrap();
        assert_eq!(wire, b"abc\n");
    }
}
