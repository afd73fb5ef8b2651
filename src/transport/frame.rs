//! Wire framing for the external byte stream.
//!
//! ```text
//! [ASCII decimal length] "\n" [channel-id] "\n" [payload bytes]
//! ```
//!
//! `length` counts everything after the first newline: the channel id, its
//! trailing newline, and the payload. An empty channel id addresses the
//! control band. A frame whose declared length is not consumed exactly is a
//! protocol error — there is no resynchronization, the whole transport closes.

use bytes::{Buf, BytesMut};

use crate::error::Problem;

/// One decoded frame: a channel id (empty string = control band) and its
/// payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: String,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.channel.is_empty()
    }

    /// Encode this frame to wire bytes.
    #[must_use]
    pub fn encode(channel: &str, payload: &[u8]) -> Vec<u8> {
        let remainder_len = channel.len() + 1 + payload.len();
        let mut out = Vec::with_capacity(remainder_len + 12);
        out.extend_from_slice(remainder_len.to_string().as_bytes());
        out.push(b'\n');
        out.extend_from_slice(channel.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(payload);
        out
    }
}

/// Maximum accepted frame length — guards against a malicious/garbled length
/// prefix trying to make us buffer unbounded memory. An unbounded cap would
/// defeat the outbound backpressure mechanism; 256 MiB is generously above
/// any legitimate single frame (file/metrics chunks are capped far lower by
/// their channels).
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Incremental decoder: feed it arbitrary byte chunks as they arrive off the
/// wire, get back zero or more complete [`Frame`]s.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly-read bytes and drain as many complete frames as are now
    /// available. Returns `Err(Problem::ProtocolError)` on any malformed
    /// length prefix or missing channel-id separator.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Frame>, Problem> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            match self.try_parse_one()? {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        Ok(frames)
    }

    fn try_parse_one(&mut self) -> Result<Option<Frame>, Problem> {
        let Some(newline_at) = self.buf.iter().position(|&b| b == b'\n') else {
            if self.buf.len() > 20 {
                // Twenty ASCII digits is far more than 2^64 needs; anything
                // longer without a newline is not a length prefix at all.
                return Err(Problem::ProtocolError);
            }
            return Ok(None);
        };

        let len_str =
            std::str::from_utf8(&self.buf[..newline_at]).map_err(|_| Problem::ProtocolError)?;
        let remainder_len: usize = len_str.parse().map_err(|_| Problem::ProtocolError)?;
        if remainder_len > MAX_FRAME_LEN {
            return Err(Problem::ProtocolError);
        }

        let header_len = newline_at + 1;
        if self.buf.len() < header_len + remainder_len {
            // Not enough bytes yet; wait for more.
            return Ok(None);
        }

        let remainder = &self.buf[header_len..header_len + remainder_len];
        let channel_nl = remainder
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(Problem::ProtocolError)?;
        let channel = std::str::from_utf8(&remainder[..channel_nl])
            .map_err(|_| Problem::ProtocolError)?
            .to_owned();
        let payload = remainder[channel_nl + 1..].to_vec();

        self.buf.advance(header_len + remainder_len);
        Ok(Some(Frame { channel, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip_control() {
        let encoded = Frame::encode("", br#"{"command":"init"}"#);
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_control());
        assert_eq!(frames[0].payload, br#"{"command":"init"}"#);
    }

    #[test]
    fn encode_decode_roundtrip_channel() {
        let encoded = Frame::encode("554", b"Yeehaw!");
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, "554");
        assert_eq!(frames[0].payload, b"Yeehaw!");
    }

    #[test]
    fn partial_feed_waits_for_more_bytes() {
        let encoded = Frame::encode("554", b"Yeehaw!");
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(&encoded[..5]).unwrap();
        assert!(frames.is_empty());
        let frames = dec.feed(&encoded[5..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"Yeehaw!");
    }

    #[test]
    fn multiple_frames_in_one_feed() {
        let mut bytes = Frame::encode("a", b"one");
        bytes.extend_from_slice(&Frame::encode("b", b"two"));
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(&bytes).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, b"one");
        assert_eq!(frames[1].payload, b"two");
    }

    #[test]
    fn bogus_length_prefix_is_protocol_error() {
        let mut dec = FrameDecoder::new();
        assert_eq!(dec.feed(b"notanumber\nfoo\n"), Err(Problem::ProtocolError));
    }

    #[test]
    fn missing_channel_separator_is_protocol_error() {
        // remainder has no embedded newline at all
        let mut dec = FrameDecoder::new();
        assert_eq!(dec.feed(b"3\nabc"), Err(Problem::ProtocolError));
    }
}
