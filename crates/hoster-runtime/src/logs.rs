//! Demultiplexer for the runtime's multiplexed log wire format.
//!
//! When a container runs without a TTY, the runtime interleaves stdout and
//! stderr on one connection. Each frame starts with an 8-byte header: byte 0
//! is the stream (1 = stdout, 2 = stderr), bytes 4–7 are the payload length,
//! big-endian. bollard demultiplexes for us on the normal path; this decoder
//! exists for raw attach streams and for consumers fed pre-recorded bytes.

use bytes::{Buf, Bytes, BytesMut};

use crate::client::{LogChunk, StdStream};
use crate::error::{Result, RuntimeError};

const HEADER_LEN: usize = 8;

/// Incremental frame decoder. Feed it bytes as they arrive; complete frames
/// come out, partial ones wait for more input.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// The next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<LogChunk>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let stream = match self.buffer[0] {
            0 | 1 => StdStream::Stdout,
            2 => StdStream::Stderr,
            other => {
                return Err(RuntimeError::Api {
                    status: 500,
                    message: format!("unknown log stream marker {other}"),
                });
            }
        };
        let len = u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]) as usize;
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.buffer.advance(HEADER_LEN);
        let message: Bytes = self.buffer.split_to(len).freeze();
        Ok(Some(LogChunk { stream, message }))
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Decode a complete buffer into frames. Trailing partial frames are an
/// error; use [`FrameDecoder`] for streaming input.
pub fn demux(data: &[u8]) -> Result<Vec<LogChunk>> {
    let mut decoder = FrameDecoder::new();
    decoder.extend(data);
    let mut frames = Vec::new();
    while let Some(frame) = decoder.next_frame()? {
        frames.push(frame);
    }
    if decoder.pending() > 0 {
        return Err(RuntimeError::Api {
            status: 500,
            message: format!("{} trailing bytes in log stream", decoder.pending()),
        });
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn demuxes_interleaved_streams() {
        let mut data = frame(1, b"out line\n");
        data.extend(frame(2, b"err line\n"));
        data.extend(frame(1, b"more out\n"));

        let frames = demux(&data).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].stream, StdStream::Stdout);
        assert_eq!(&frames[0].message[..], b"out line\n");
        assert_eq!(frames[1].stream, StdStream::Stderr);
        assert_eq!(frames[2].stream, StdStream::Stdout);
    }

    #[test]
    fn incremental_feeding_reassembles_split_frames() {
        let data = frame(2, b"split across reads");
        let mut decoder = FrameDecoder::new();

        decoder.extend(&data[..5]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&data[5..11]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&data[11..]);
        let chunk = decoder.next_frame().unwrap().unwrap();
        assert_eq!(chunk.stream, StdStream::Stderr);
        assert_eq!(&chunk.message[..], b"split across reads");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn rejects_unknown_stream_marker() {
        let data = frame(7, b"bogus");
        assert!(demux(&data).is_err());
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        let mut data = frame(1, b"ok");
        data.extend_from_slice(&[1, 2, 3]);
        assert!(demux(&data).is_err());
    }

    #[test]
    fn empty_payload_frame() {
        let frames = demux(&frame(1, b"")).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].message.is_empty());
    }
}
