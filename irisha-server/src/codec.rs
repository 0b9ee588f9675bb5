//! Line framing over a byte stream.
//!
//! Reads arrive in arbitrary chunks. [`LineBuffer`] accumulates them and hands
//! back complete lines, keeping any partial tail for the next read.

use bytes::{Buf, BytesMut};

/// Maximum line length on the wire, terminator included.
pub const MAX_LINE: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("line exceeds {MAX_LINE} bytes")]
    LineTooLong,
}

/// Split `buffer` into complete lines and the unconsumed remainder.
///
/// Lines end at `\n`; a preceding `\r` is stripped. Empty lines are skipped.
/// Invalid UTF-8 is replaced rather than rejected.
pub fn frame(buffer: &[u8]) -> (Vec<String>, &[u8]) {
    let (raw, remainder) = split_lines(buffer);
    let lines = raw
        .into_iter()
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect();
    (lines, remainder)
}

fn split_lines(buffer: &[u8]) -> (Vec<&[u8]>, &[u8]) {
    let mut lines = Vec::new();
    let mut rest = buffer;
    while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
        let line = &rest[..pos];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if !line.is_empty() {
            lines.push(line);
        }
        rest = &rest[pos + 1..];
    }
    (lines, rest)
}

/// Per-connection receive buffer.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and extract every complete line.
    ///
    /// Fails when a framed line, or a pending tail that can no longer fit,
    /// exceeds [`MAX_LINE`]. The connection is expected to be dropped then.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, FrameError> {
        self.buf.extend_from_slice(chunk);

        let mut consumed = 0;
        let mut lines = Vec::new();
        while let Some(pos) = self.buf[consumed..].iter().position(|&b| b == b'\n') {
            // pos + 1 covers the terminator; a missing \r only makes it shorter.
            if pos + 1 > MAX_LINE {
                return Err(FrameError::LineTooLong);
            }
            let (framed, _) = frame(&self.buf[consumed..consumed + pos + 1]);
            lines.extend(framed);
            consumed += pos + 1;
        }
        self.buf.advance(consumed);

        // A tail that cannot be completed within the limit is already too long.
        if self.buf.len() >= MAX_LINE {
            return Err(FrameError::LineTooLong);
        }
        Ok(lines)
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::Message;
    use pretty_assertions::assert_eq;

    const STREAM: &[u8] =
        b"PASS secret\r\nNICK alice\r\nUSER alice 0 * :Alice Liddell\r\nJOIN #lobby,#dev k1\r\n";

    fn parse_all(lines: &[String]) -> Vec<Message> {
        lines.iter().map(|l| Message::parse(l)).collect()
    }

    #[test]
    fn frame_returns_remainder() {
        let (lines, rest) = frame(b"NICK a\r\nUSER a 0 * :A\r\nJOI");
        assert_eq!(lines, vec!["NICK a", "USER a 0 * :A"]);
        assert_eq!(rest, b"JOI");
    }

    #[test]
    fn frame_accepts_bare_newline_and_skips_blank_lines() {
        let (lines, rest) = frame(b"PING x\n\r\n\nPONG y\r\n");
        assert_eq!(lines, vec!["PING x", "PONG y"]);
        assert!(rest.is_empty());
    }

    #[test]
    fn terminator_split_across_reads() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"NICK alice\r").unwrap().is_empty());
        assert_eq!(buf.push(b"\nUSER").unwrap(), vec!["NICK alice"]);
        assert_eq!(buf.pending(), 4);
    }

    #[test]
    fn chunking_does_not_change_parsed_commands() {
        let whole = {
            let mut buf = LineBuffer::new();
            parse_all(&buf.push(STREAM).unwrap())
        };
        assert_eq!(whole.len(), 4);

        for chunk_size in 1..STREAM.len() {
            let mut buf = LineBuffer::new();
            let mut lines = Vec::new();
            for chunk in STREAM.chunks(chunk_size) {
                lines.extend(buf.push(chunk).unwrap());
            }
            assert_eq!(parse_all(&lines), whole, "chunk size {chunk_size}");
            assert_eq!(buf.pending(), 0);
        }
    }

    #[test]
    fn line_at_limit_is_accepted() {
        let mut line = vec![b'a'; MAX_LINE - 2];
        line.extend_from_slice(b"\r\n");
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(&line).unwrap().len(), 1);
    }

    #[test]
    fn overlong_line_is_rejected() {
        let mut line = vec![b'a'; MAX_LINE];
        line.extend_from_slice(b"\r\n");
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(&line), Err(FrameError::LineTooLong));
    }

    #[test]
    fn unterminated_tail_past_limit_is_rejected() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(&[b'x'; 300]).is_ok());
        assert_eq!(buf.push(&[b'x'; 300]), Err(FrameError::LineTooLong));
    }
}
