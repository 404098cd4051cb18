//! Streaming frame encoding and decoding.

use crate::error::{Error, Result};
use crate::protocol::frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// Frame encoder with buffer reuse.
#[derive(Debug, Default)]
pub struct FrameEncoder {
    buffer: BytesMut,
}

impl FrameEncoder {
    /// Create an encoder with a default scratch buffer.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: BytesMut::with_capacity(8 * 1024) }
    }

    /// Encode a frame, reusing the internal buffer.
    pub fn encode(&mut self, frame: &Frame) -> Bytes {
        self.buffer.clear();
        frame.encode_into(&mut self.buffer);
        self.buffer.split().freeze()
    }
}

/// Decoder statistics for monitoring.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecoderStats {
    /// Frames successfully decoded.
    pub frames_decoded: u64,
    /// Bytes fed into the decoder.
    pub bytes_processed: u64,
    /// Largest accumulation buffer observed.
    pub peak_buffer_size: usize,
}

/// Streaming frame decoder.
///
/// Accumulates partial reads and yields complete frames in arrival order.
/// Any malformed input (unknown type, oversized length) is a protocol
/// violation: the caller is expected to close the peer, so the decoder does
/// not attempt resynchronization.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    queue: VecDeque<Frame>,
    max_payload: u32,
    stats: DecoderStats,
}

impl FrameDecoder {
    /// Create a decoder with the default payload cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    /// Create a decoder with a custom payload cap.
    #[must_use]
    pub fn with_max_payload(max_payload: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            queue: VecDeque::new(),
            max_payload,
            stats: DecoderStats::default(),
        }
    }

    /// Feed bytes from the wire. Returns how many complete frames became
    /// available; retrieve them with [`FrameDecoder::next_frame`].
    ///
    /// # Errors
    /// Returns [`Error::ProtocolViolation`] on malformed input. The decoder
    /// is unusable afterwards.
    pub fn decode_stream(&mut self, data: &[u8]) -> Result<usize> {
        self.buffer.extend_from_slice(data);
        self.stats.bytes_processed += data.len() as u64;
        self.stats.peak_buffer_size = self.stats.peak_buffer_size.max(self.buffer.len());

        let mut decoded = 0;
        while self.buffer.len() >= FRAME_HEADER_SIZE {
            let header = &self.buffer[..FRAME_HEADER_SIZE];
            let frame_type = FrameType::from_u8(header[0])?;
            let payload_len = u32::from_be_bytes([header[9], header[10], header[11], header[12]]);
            if payload_len > self.max_payload {
                return Err(Error::protocol(format!(
                    "advertised payload of {payload_len} bytes exceeds the {}-byte cap",
                    self.max_payload
                )));
            }
            let total = FRAME_HEADER_SIZE + payload_len as usize;
            if self.buffer.len() < total {
                break;
            }
            let mut header = self.buffer.split_to(FRAME_HEADER_SIZE);
            header.advance(1);
            let sequence = header.get_u64();
            let payload = self.buffer.split_to(payload_len as usize).freeze();
            self.queue.push_back(Frame::new(frame_type, sequence, payload)?);
            decoded += 1;
            self.stats.frames_decoded += 1;
        }
        Ok(decoded)
    }

    /// The next decoded frame, in arrival order.
    #[must_use]
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.queue.pop_front()
    }

    /// Whether decoded frames are waiting.
    #[must_use]
    pub fn has_frames(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Decoder statistics.
    #[must_use]
    pub const fn stats(&self) -> &DecoderStats {
        &self.stats
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{Handshake, NodeMessage};
    use crate::{Message, Topic, EndpointId};

    fn item_frame(seq: u64) -> Frame {
        let msg = NodeMessage {
            message: Message::data(
                Topic::parse("t").unwrap(),
                Bytes::from(format!("payload-{seq}")),
            ),
            ttl: 3,
            path: vec![EndpointId::generate()],
        };
        Frame::item(seq, &msg).unwrap()
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();

        let frame = item_frame(7);
        let wire = encoder.encode(&frame);
        assert_eq!(decoder.decode_stream(&wire).unwrap(), 1);
        assert_eq!(decoder.next_frame().unwrap(), frame);
    }

    #[test]
    fn decodes_multiple_frames_in_order() {
        let mut encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();

        let mut wire = BytesMut::new();
        for seq in 1..=3 {
            wire.extend_from_slice(&encoder.encode(&item_frame(seq)));
        }
        assert_eq!(decoder.decode_stream(&wire).unwrap(), 3);
        for seq in 1..=3 {
            assert_eq!(decoder.next_frame().unwrap().sequence(), seq);
        }
        assert!(!decoder.has_frames());
    }

    #[test]
    fn reassembles_partial_reads() {
        let mut encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();

        let wire = encoder.encode(&item_frame(1));
        let (head, tail) = wire.split_at(wire.len() / 2);
        assert_eq!(decoder.decode_stream(head).unwrap(), 0);
        assert_eq!(decoder.decode_stream(tail).unwrap(), 1);
        assert_eq!(decoder.next_frame().unwrap().sequence(), 1);
    }

    #[test]
    fn unknown_type_is_a_protocol_violation() {
        let mut decoder = FrameDecoder::new();
        let garbage = [0xeeu8; FRAME_HEADER_SIZE];
        assert!(matches!(
            decoder.decode_stream(&garbage),
            Err(Error::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn oversized_length_is_a_protocol_violation() {
        let mut decoder = FrameDecoder::with_max_payload(16);
        let frame =
            Frame::hello(&Handshake {
                ident: "broker.v1".into(),
                endpoint: EndpointId::generate(),
                credit_window: 4,
            })
            .unwrap();
        let wire = FrameEncoder::new().encode(&frame);
        assert!(matches!(
            decoder.decode_stream(&wire),
            Err(Error::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn empty_payload_frames() {
        let mut encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();
        let wire = encoder.encode(&Frame::heartbeat());
        assert_eq!(wire.len(), FRAME_HEADER_SIZE);
        assert_eq!(decoder.decode_stream(&wire).unwrap(), 1);
        let frame = decoder.next_frame().unwrap();
        assert_eq!(frame.frame_type(), FrameType::Heartbeat);
        assert!(frame.payload().is_empty());
    }
}
