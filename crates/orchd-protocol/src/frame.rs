//! Frame encoding and incremental decoding for the FIFO transport.
//!
//! Every message travels inside a frame: a 4-byte signature (`0xFEEDFEED`),
//! a 4-byte payload length, then the payload. Lengths are native-endian —
//! the transport never leaves the machine. A whole frame must fit inside
//! `PIPE_BUF` so a single `write` is atomic even with many concurrent
//! writers on the server FIFO; that bound is where [`IPC_MAX`] comes from.
//!
//! Decoding is incremental: the FIFO hands back arbitrary read chunks, so
//! the decoder buffers a partial trailing frame and completes it from the
//! next read. A frame with a bad signature or an out-of-range length means
//! the stream is desynchronized; the decoder reports that distinctly so the
//! connection can drain the backlog and resume at a clean boundary.

use thiserror::Error;

/// Marks the beginning of every frame.
pub const FRAME_SIGNATURE: u32 = 0xFEED_FEED;

/// Signature + payload length.
pub const FRAME_HEADER_LEN: usize = 8;

/// Maximum payload length of a single message.
pub const IPC_MAX: usize = libc::PIPE_BUF - FRAME_HEADER_LEN;

/// Receive buffer size; comfortably above anything a single read returns.
pub const RECV_BUFFER_LEN: usize = 4 * libc::PIPE_BUF;

/// Framing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Payload is empty or exceeds [`IPC_MAX`]; the frame was never built.
    #[error("payload length {0} outside 1..={IPC_MAX}")]
    BadPayloadLength(usize),

    /// The byte stream no longer starts at a frame boundary.
    #[error("invalid frame header; stream desynchronized")]
    Desynchronized,
}

/// Wrap `payload` in a frame.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() || payload.len() > IPC_MAX {
        return Err(FrameError::BadPayloadLength(payload.len()));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&FRAME_SIGNATURE.to_ne_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Incremental frame decoder over a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the pipe.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to decode the next complete frame.
    ///
    /// `Ok(None)` means more bytes are needed (an incomplete header or a
    /// partial payload stays buffered). `Err(Desynchronized)` means the
    /// buffered bytes do not start with a valid header; the caller should
    /// [`clear`](Self::clear) and drain its input.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let signature = u32::from_ne_bytes(self.buf[0..4].try_into().unwrap());
        let payload_len = u32::from_ne_bytes(self.buf[4..8].try_into().unwrap()) as usize;
        if signature != FRAME_SIGNATURE || payload_len == 0 || payload_len > IPC_MAX {
            return Err(FrameError::Desynchronized);
        }

        let total = FRAME_HEADER_LEN + payload_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let payload = self.buf[FRAME_HEADER_LEN..total].to_vec();
        // Compact: move any residual bytes to the front of the buffer.
        self.buf.drain(..total);
        Ok(Some(payload))
    }

    /// Bytes buffered but not yet decoded (a partial frame at EOF).
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Discard all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_single_frame() {
        let frame = encode(b"hello").unwrap();
        let mut dec = FrameDecoder::new();
        dec.feed(&frame);
        assert_eq!(dec.next_frame().unwrap().unwrap(), b"hello");
        assert_eq!(dec.next_frame().unwrap(), None);
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn decodes_back_to_back_frames_in_order() {
        let mut bytes = encode(b"one").unwrap();
        bytes.extend(encode(b"two").unwrap());
        bytes.extend(encode(b"three").unwrap());

        let mut dec = FrameDecoder::new();
        dec.feed(&bytes);
        assert_eq!(dec.next_frame().unwrap().unwrap(), b"one");
        assert_eq!(dec.next_frame().unwrap().unwrap(), b"two");
        assert_eq!(dec.next_frame().unwrap().unwrap(), b"three");
        assert_eq!(dec.next_frame().unwrap(), None);
    }

    #[test]
    fn reassembles_frame_split_across_reads() {
        let frame = encode(b"split payload").unwrap();
        let (a, b) = frame.split_at(10);

        let mut dec = FrameDecoder::new();
        dec.feed(a);
        assert_eq!(dec.next_frame().unwrap(), None);
        assert!(dec.pending() > 0);
        dec.feed(b);
        assert_eq!(dec.next_frame().unwrap().unwrap(), b"split payload");
    }

    #[test]
    fn rejects_empty_payload() {
        assert_eq!(encode(b""), Err(FrameError::BadPayloadLength(0)));
    }

    #[test]
    fn rejects_oversized_payload() {
        let big = vec![0u8; IPC_MAX + 1];
        assert_eq!(encode(&big), Err(FrameError::BadPayloadLength(IPC_MAX + 1)));
    }

    #[test]
    fn accepts_maximum_payload() {
        let max = vec![7u8; IPC_MAX];
        let frame = encode(&max).unwrap();
        let mut dec = FrameDecoder::new();
        dec.feed(&frame);
        assert_eq!(dec.next_frame().unwrap().unwrap(), max);
    }

    #[test]
    fn bad_signature_is_desync() {
        let mut frame = encode(b"x").unwrap();
        frame[0] ^= 0xFF;
        let mut dec = FrameDecoder::new();
        dec.feed(&frame);
        assert_eq!(dec.next_frame(), Err(FrameError::Desynchronized));
    }

    #[test]
    fn zero_length_header_is_desync() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&FRAME_SIGNATURE.to_ne_bytes());
        frame.extend_from_slice(&0u32.to_ne_bytes());
        let mut dec = FrameDecoder::new();
        dec.feed(&frame);
        assert_eq!(dec.next_frame(), Err(FrameError::Desynchronized));
    }

    #[test]
    fn oversized_length_header_is_desync() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&FRAME_SIGNATURE.to_ne_bytes());
        frame.extend_from_slice(&((IPC_MAX + 1) as u32).to_ne_bytes());
        let mut dec = FrameDecoder::new();
        dec.feed(&frame);
        assert_eq!(dec.next_frame(), Err(FrameError::Desynchronized));
    }

    #[test]
    fn clear_recovers_after_desync() {
        let mut dec = FrameDecoder::new();
        dec.feed(b"garbage-garbage");
        assert_eq!(dec.next_frame(), Err(FrameError::Desynchronized));
        dec.clear();
        dec.feed(&encode(b"clean").unwrap());
        assert_eq!(dec.next_frame().unwrap().unwrap(), b"clean");
    }
}
