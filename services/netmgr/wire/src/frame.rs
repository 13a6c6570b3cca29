//! Length-prefixed message framing.
//!
//! Outgoing messages are encoded with [`encode_frame`]. Incoming bytes are
//! appended to a [`FrameBuffer`] as they arrive; [`FrameBuffer::next_frame`]
//! detaches at most one complete message per call so the caller decides
//! when the next one may be dispatched.

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest payload a single frame can carry
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Largest encoded frame (prefix plus payload)
pub const MAX_FRAME_SIZE: usize = LENGTH_PREFIX_SIZE + MAX_MESSAGE_SIZE;

/// Default size of one socket read
pub const DEFAULT_RECV_CHUNK: usize = 64 * 1024;

/// Encode `payload` as a length-prefixed frame
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, WireError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Peek at the declared payload length, if the prefix is complete
pub fn peek_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return None;
    }
    Some(u16::from_be_bytes([buf[0], buf[1]]) as usize)
}

/// Bounded reassembly buffer for a framed stream
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    limit: usize,
}

impl FrameBuffer {
    /// Create a buffer sized for one maximum frame plus one default read
    pub fn new() -> Self {
        Self::with_chunk(DEFAULT_RECV_CHUNK)
    }

    /// Create a buffer sized for one maximum frame plus one read of `chunk` bytes
    pub fn with_chunk(chunk: usize) -> Self {
        let limit = MAX_FRAME_SIZE + chunk.max(1);
        Self {
            buf: BytesMut::with_capacity(chunk.max(1).min(limit)),
            limit,
        }
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Upper bound on buffered bytes
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Free space before the bound is reached
    pub fn remaining(&self) -> usize {
        self.limit - self.buf.len()
    }

    /// Append freshly received bytes
    pub fn extend(&mut self, data: &[u8]) -> Result<(), WireError> {
        if data.len() > self.remaining() {
            return Err(WireError::BufferFull {
                buffered: self.buf.len(),
                incoming: data.len(),
                limit: self.limit,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Declared length of the message at the head of the buffer
    pub fn pending_length(&self) -> Option<usize> {
        peek_length(&self.buf)
    }

    /// Whether a complete message is buffered
    pub fn has_frame(&self) -> bool {
        match self.pending_length() {
            Some(len) => self.buf.len() >= LENGTH_PREFIX_SIZE + len,
            None => false,
        }
    }

    /// Detach the next complete message, prefix stripped
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let len = self.pending_length()?;
        if self.buf.len() < LENGTH_PREFIX_SIZE + len {
            return None;
        }

        self.buf.advance(LENGTH_PREFIX_SIZE);
        Some(self.buf.split_to(len).freeze())
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn drain(fb: &mut FrameBuffer) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(frame) = fb.next_frame() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_encode_frame() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(&frame[..], b"\x00\x05hello");

        let empty = encode_frame(b"").unwrap();
        assert_eq!(&empty[..], b"\x00\x00");
    }

    #[test]
    fn test_encode_too_large() {
        let payload = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert_eq!(
            encode_frame(&payload),
            Err(WireError::TooLarge(MAX_MESSAGE_SIZE + 1))
        );

        let payload = vec![0u8; MAX_MESSAGE_SIZE];
        let frame = encode_frame(&payload).unwrap();
        assert_eq!(frame.len(), MAX_FRAME_SIZE);
        assert_eq!(&frame[..2], &[0xff, 0xff]);
    }

    #[test]
    fn test_split_one_three_three() {
        let mut fb = FrameBuffer::new();
        let wire = encode_frame(b"hello").unwrap();

        fb.extend(&wire[..1]).unwrap();
        assert_eq!(fb.pending_length(), None);
        assert!(fb.next_frame().is_none());

        fb.extend(&wire[1..4]).unwrap();
        assert_eq!(fb.pending_length(), Some(5));
        assert!(fb.next_frame().is_none());

        fb.extend(&wire[4..7]).unwrap();
        assert_eq!(fb.next_frame().as_deref(), Some(&b"hello"[..]));
        assert!(fb.next_frame().is_none());
        assert!(fb.is_empty());
    }

    #[test]
    fn test_coalesced_frames_one_per_call() {
        let mut fb = FrameBuffer::new();
        let mut wire = Vec::new();
        for msg in [&b"one"[..], b"", b"three"] {
            wire.extend_from_slice(&encode_frame(msg).unwrap());
        }
        fb.extend(&wire).unwrap();

        assert_eq!(fb.next_frame().as_deref(), Some(&b"one"[..]));
        assert!(fb.has_frame());
        assert_eq!(fb.next_frame().as_deref(), Some(&b""[..]));
        assert_eq!(fb.next_frame().as_deref(), Some(&b"three"[..]));
        assert!(fb.next_frame().is_none());
    }

    #[test]
    fn test_random_chunking() {
        let mut rng = rand::thread_rng();
        let messages: Vec<Vec<u8>> = (0..200)
            .map(|i| {
                let len = rng.gen_range(0..2048);
                vec![(i % 251) as u8; len]
            })
            .collect();

        let mut wire = Vec::new();
        for msg in &messages {
            wire.extend_from_slice(&encode_frame(msg).unwrap());
        }

        let mut fb = FrameBuffer::with_chunk(4096);
        let mut received = Vec::new();
        let mut pos = 0;
        while pos < wire.len() {
            let step = rng.gen_range(1..=4096).min(wire.len() - pos);
            fb.extend(&wire[pos..pos + step]).unwrap();
            pos += step;
            received.extend(drain(&mut fb));
        }

        assert_eq!(received.len(), messages.len());
        for (got, want) in received.iter().zip(&messages) {
            assert_eq!(&got[..], &want[..]);
        }
        assert!(fb.is_empty());
    }

    #[test]
    fn test_declared_max_length_incomplete() {
        let mut fb = FrameBuffer::new();
        fb.extend(&[0xff, 0xff]).unwrap();
        fb.extend(&[0u8; 8]).unwrap();

        assert_eq!(fb.pending_length(), Some(MAX_MESSAGE_SIZE));
        assert!(!fb.has_frame());
        assert!(fb.next_frame().is_none());
        assert_eq!(fb.len(), 10);
    }

    #[test]
    fn test_buffer_bound() {
        let mut fb = FrameBuffer::with_chunk(16);
        assert_eq!(fb.limit(), MAX_FRAME_SIZE + 16);

        let wire = encode_frame(&vec![0u8; MAX_MESSAGE_SIZE]).unwrap();
        fb.extend(&wire).unwrap();
        assert_eq!(fb.remaining(), 16);

        let err = fb.extend(&[0u8; 17]).unwrap_err();
        assert_eq!(
            err,
            WireError::BufferFull {
                buffered: MAX_FRAME_SIZE,
                incoming: 17,
                limit: MAX_FRAME_SIZE + 16,
            }
        );

        // A maximum frame always fits and frees its space once detached
        let frame = fb.next_frame().unwrap();
        assert_eq!(frame.len(), MAX_MESSAGE_SIZE);
        assert_eq!(fb.remaining(), fb.limit());
    }
}
