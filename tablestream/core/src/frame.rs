//! Event-Stream Frame Parser
//!
//! Incremental parser for the `text/event-stream` body of the availability
//! feed.
//!
//! # Frame Format
//!
//! ```text
//! event: availability-update\n
//! data: {"slots":[{"time":"19:00","isAvailable":false}]}\n
//! \n
//! ```
//!
//! A blank line terminates a frame once a payload has been seen. Only
//! newline-terminated lines are interpreted, and the buffer is only ever
//! consumed up to a frame boundary, so feeding the same bytes in any chunking
//! yields the same frames.

use crate::error::StreamError;

/// Upper bound on unterminated buffered text (4 MB)
///
/// A server that never sends a frame terminator would otherwise grow the
/// buffer without limit.
pub const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Event name the server uses for keep-alives
pub const HEARTBEAT_EVENT: &str = "heartbeat";
/// Event name for a full initial snapshot
pub const AVAILABILITY_EVENT: &str = "availability";
/// Event name for a replacement snapshot after a change
pub const AVAILABILITY_UPDATE_EVENT: &str = "availability-update";

/// One complete `event:`/`data:` unit from the stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Event name; empty when the server did not send one
    pub event_type: String,
    /// Raw payload text
    pub data: String,
}

/// What a frame's event name means to the client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Keep-alive; payload is never parsed
    Heartbeat,
    /// Full snapshot meant as first paint
    Availability,
    /// Full snapshot after a change
    AvailabilityUpdate,
    /// Empty or unknown event name
    Unspecified,
}

impl Frame {
    /// Create a frame
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
        }
    }

    /// Classify by event name
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self.event_type.as_str() {
            HEARTBEAT_EVENT => FrameKind::Heartbeat,
            AVAILABILITY_EVENT => FrameKind::Availability,
            AVAILABILITY_UPDATE_EVENT => FrameKind::AvailabilityUpdate,
            _ => FrameKind::Unspecified,
        }
    }
}

/// Extract every complete frame from `buffer`
///
/// Returns the frames in order and the unconsumed remainder, which always
/// starts at a frame boundary and should be prefixed to the next chunk.
#[must_use]
pub fn parse_frames(buffer: &str) -> (Vec<Frame>, &str) {
    let mut frames = Vec::new();
    let mut consumed = 0;
    let mut pos = 0;

    let mut event_type: Option<String> = None;
    let mut data: Option<String> = None;

    while let Some(offset) = buffer[pos..].find('\n') {
        let line_end = pos + offset;
        let raw = &buffer[pos..line_end];
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        pos = line_end + 1;

        if line.is_empty() {
            if let Some(payload) = data.take() {
                frames.push(Frame {
                    event_type: event_type.take().unwrap_or_default(),
                    data: payload,
                });
            } else {
                event_type = None;
            }
            consumed = pos;
            continue;
        }

        // Comment line
        if line.starts_with(':') {
            continue;
        }

        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            let value = value.trim();
            match data {
                Some(ref mut existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        }
        // id:, retry: and unknown fields are ignored
    }

    (frames, &buffer[consumed..])
}

/// Buffering decoder for a byte stream
///
/// Holds back incomplete UTF-8 sequences and unterminated frames between
/// chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
    pending_bytes: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the transport
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.pending_bytes.extend_from_slice(bytes);

        loop {
            match std::str::from_utf8(&self.pending_bytes) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending_bytes.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&self.pending_bytes[..valid]) {
                        self.buffer.push_str(text);
                    }
                    match e.error_len() {
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.pending_bytes.drain(..valid + len);
                        }
                        None => {
                            // Truncated sequence, wait for the rest
                            self.pending_bytes.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Append already-decoded text
    pub fn push_str(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    /// Bytes of text not yet consumed by a complete frame
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.pending_bytes.len()
    }

    /// Drain every complete frame
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Parse` when the unterminated remainder exceeds
    /// [`MAX_BUFFER_SIZE`].
    pub fn decode(&mut self) -> Result<Vec<Frame>, StreamError> {
        let (frames, consumed) = {
            let (frames, remainder) = parse_frames(&self.buffer);
            (frames, self.buffer.len() - remainder.len())
        };
        self.buffer.drain(..consumed);

        if self.buffer.len() > MAX_BUFFER_SIZE {
            return Err(StreamError::Parse(format!(
                "unterminated frame exceeds {MAX_BUFFER_SIZE} bytes"
            )));
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const STREAM: &str = concat!(
        ": connected\n",
        "event: availability\n",
        "data: {\"slots\":[{\"time\":\"19:00\",\"isAvailable\":true}]}\n",
        "\n",
        "event: heartbeat\n",
        "data: ping\n",
        "\n",
        "data: {\"slots\":[]}\n",
        "\n",
        "event: availability-update\r\n",
        "data: {\"slots\":[{\"time\":\"19:00\",\"isAvailable\":false}]}\r\n",
        "\r\n",
    );

    fn whole_stream_frames() -> Vec<Frame> {
        let (frames, remainder) = parse_frames(STREAM);
        assert!(remainder.is_empty());
        frames
    }

    #[test]
    fn test_parse_complete_stream() {
        let frames = whole_stream_frames();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].kind(), FrameKind::Availability);
        assert_eq!(frames[1], Frame::new("heartbeat", "ping"));
        assert_eq!(frames[2].event_type, "");
        assert_eq!(frames[2].kind(), FrameKind::Unspecified);
        assert_eq!(frames[3].kind(), FrameKind::AvailabilityUpdate);
        assert_eq!(
            frames[3].data,
            r#"{"slots":[{"time":"19:00","isAvailable":false}]}"#
        );
    }

    #[test]
    fn test_unterminated_frame_stays_in_remainder() {
        let input = "event: availability\ndata: {\"slots\":[]}\n\nevent: availability-update\ndata: {\"sl";
        let (frames, remainder) = parse_frames(input);
        assert_eq!(frames.len(), 1);
        assert_eq!(remainder, "event: availability-update\ndata: {\"sl");

        // A complete data line without the blank terminator is not a frame yet
        let (frames, remainder) = parse_frames("data: {\"slots\":[]}\n");
        assert!(frames.is_empty());
        assert_eq!(remainder, "data: {\"slots\":[]}\n");
    }

    #[test]
    fn test_blank_line_without_payload_resets_event() {
        let (frames, remainder) = parse_frames("event: heartbeat\n\ndata: x\n\n");
        assert!(remainder.is_empty());
        assert_eq!(frames, vec![Frame::new("", "x")]);
    }

    #[test]
    fn test_multiple_data_lines_are_joined() {
        let (frames, _) = parse_frames("data: {\"slots\":\ndata: []}\n\n");
        assert_eq!(frames[0].data, "{\"slots\":\n[]}");
    }

    #[test]
    fn test_chunking_invariance_byte_by_byte() {
        let expected = whole_stream_frames();
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();

        for byte in STREAM.as_bytes() {
            decoder.push_bytes(std::slice::from_ref(byte));
            frames.extend(decoder.decode().unwrap());
        }

        assert_eq!(frames, expected);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_chunking_invariance_every_split_point() {
        let expected = whole_stream_frames();
        let bytes = STREAM.as_bytes();

        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::new();
            decoder.push_bytes(&bytes[..split]);
            let mut frames = decoder.decode().unwrap();
            decoder.push_bytes(&bytes[split..]);
            frames.extend(decoder.decode().unwrap());
            assert_eq!(frames, expected, "split at byte {split}");
        }
    }

    #[test]
    fn test_split_multibyte_character() {
        let text = "data: {\"note\":\"terraço\"}\n\n";
        let bytes = text.as_bytes();
        let cut = text.find('ç').unwrap() + 1; // inside the two-byte sequence

        let mut decoder = FrameDecoder::new();
        decoder.push_bytes(&bytes[..cut]);
        assert!(decoder.decode().unwrap().is_empty());
        decoder.push_bytes(&bytes[cut..]);

        let frames = decoder.decode().unwrap();
        assert_eq!(frames[0].data, "{\"note\":\"terraço\"}");
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut decoder = FrameDecoder::new();
        decoder.push_bytes(b"data: a\xffb\n\n");
        let frames = decoder.decode().unwrap();
        assert_eq!(frames[0].data, "a\u{FFFD}b");
    }

    #[test]
    fn test_oversized_remainder_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push_str("data: ");
        decoder.push_str(&"x".repeat(MAX_BUFFER_SIZE));
        assert!(matches!(decoder.decode(), Err(StreamError::Parse(_))));
    }
}
