//! Frame reassembly for stream transports.
//!
//! A stream carries frames back to back. The length field in bytes 2..4
//! gives the body size, so a frame is complete once `20 + length` bytes are
//! buffered. Anything after that belongs to the next frame.

use bytes::{Buf, BytesMut};

use crate::codec::declared_frame_len;

/// Accumulates stream bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct StreamFrameReader {
    buf: BytesMut,
}

impl StreamFrameReader {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let len = declared_frame_len(&self.buf)?;
        if self.buf.len() < len {
            return None;
        }
        let frame = self.buf.split_to(len).to_vec();
        Some(frame)
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buf.remaining()
    }

    /// Drop partial data, e.g. after the stream was replaced.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
