//! Splitting inbound device bytes into text frames.
//!
//! In [`Framing::Line`] mode frames end at `\n`. Bytes after the last newline
//! are kept until the next read, so a line split across TCP segments arrives
//! as one frame and a read holding several lines yields several frames. A
//! line that grows past the configured limit is flushed as-is, and whatever is
//! buffered when the peer closes is flushed as a final frame.
//!
//! [`Framing::Read`] treats every socket read as one frame, for devices that
//! send one unterminated message per write.
//!
//! Frames are decoded as UTF-8 (invalid sequences replaced), trimmed, and
//! dropped when empty.

use crate::config::Framing;
use bytes::{Buf, BytesMut};

/// Stateful per-connection frame decoder
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    max_frame_len: usize,
    pending: BytesMut,
}

impl FrameDecoder {
    /// Create a decoder
    #[must_use]
    pub fn new(framing: Framing, max_frame_len: usize) -> Self {
        Self {
            framing,
            max_frame_len: max_frame_len.max(1),
            pending: BytesMut::new(),
        }
    }

    /// Feed one read's worth of bytes, returning every completed frame
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        match self.framing {
            Framing::Read => decode(chunk).into_iter().collect(),
            Framing::Line => self.push_line(chunk),
        }
    }

    fn push_line(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line = self.pending.split_to(end + 1);
            frames.extend(decode(&line));
        }

        if self.pending.len() > self.max_frame_len {
            tracing::warn!(
                buffered = self.pending.len(),
                limit = self.max_frame_len,
                "Unterminated frame exceeds limit, flushing"
            );
            let oversized = self.pending.split();
            frames.extend(decode(&oversized));
        }
        frames
    }

    /// Flush whatever is buffered; called once the peer has closed
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = self.pending.split();
        decode(&rest)
    }

    /// Bytes waiting for a terminator
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.remaining()
    }
}

fn decode(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_line_split_across_reads() {
        let mut decoder = FrameDecoder::new(Framing::Line, 1024);
        assert!(decoder.push(b"CODE-").is_empty());
        assert_eq!(decoder.buffered(), 5);
        assert_eq!(decoder.push(b"123\r\nCODE-4"), vec!["CODE-123"]);
        assert_eq!(decoder.push(b"56\n\n"), vec!["CODE-456"]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_multiple_lines_in_one_read() {
        let mut decoder = FrameDecoder::new(Framing::Line, 1024);
        assert_eq!(decoder.push(b"a\nb\n  \nc\n"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_trailing_partial_flushed_on_finish() {
        let mut decoder = FrameDecoder::new(Framing::Line, 1024);
        assert_eq!(decoder.push(b"done\nlast"), vec!["done"]);
        assert_eq!(decoder.finish().as_deref(), Some("last"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_oversized_line_is_flushed() {
        let mut decoder = FrameDecoder::new(Framing::Line, 4);
        assert!(decoder.push(b"abc").is_empty());
        assert_eq!(decoder.push(b"de"), vec!["abcde"]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_read_mode_is_one_frame_per_read() {
        let mut decoder = FrameDecoder::new(Framing::Read, 1024);
        assert_eq!(decoder.push(b" a\nb \n"), vec!["a\nb"]);
        assert!(decoder.push(b"\r\n").is_empty());
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut decoder = FrameDecoder::new(Framing::Line, 1024);
        assert_eq!(decoder.push(b"ok\xff\n"), vec!["ok\u{fffd}"]);
    }

    proptest! {
        #[test]
        fn test_frames_do_not_depend_on_read_boundaries(
            lines in prop::collection::vec("[A-Za-z0-9-]{1,12}", 1..8),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..6),
        ) {
            let stream = lines.iter().map(|l| format!("{l}\n")).collect::<String>().into_bytes();

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(stream.len())).collect();
            points.push(0);
            points.push(stream.len());
            points.sort_unstable();
            points.dedup();

            let mut decoder = FrameDecoder::new(Framing::Line, 1024);
            let mut frames = Vec::new();
            for pair in points.windows(2) {
                frames.extend(decoder.push(&stream[pair[0]..pair[1]]));
            }
            prop_assert_eq!(frames, lines);
            prop_assert_eq!(decoder.finish(), None);
        }
    }
}
