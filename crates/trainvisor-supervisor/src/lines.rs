//! Line framing for worker output.

/// Longest line kept in one piece; longer runs of output are split.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Splits a byte stream into text lines, carrying partial lines across
/// chunks.
///
/// `\n`, `\r\n` and a lone `\r` all end a line, so progress bars that
/// redraw in place still yield one line per update. A line that grows past
/// the length limit is emitted as is and framing restarts after it.
#[derive(Debug)]
pub struct LineSplitter {
    partial: Vec<u8>,
    max_line: usize,
    after_cr: bool,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            partial: Vec::new(),
            max_line: max_line.max(1),
            after_cr: false,
        }
    }

    /// Feed one chunk; returns the complete, non-empty lines it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            let after_cr = std::mem::replace(&mut self.after_cr, byte == b'\r');
            match byte {
                b'\n' if after_cr => {}
                b'\n' | b'\r' => self.emit(&mut lines),
                _ => {
                    self.partial.push(byte);
                    if self.partial.len() >= self.max_line {
                        self.emit(&mut lines);
                    }
                }
            }
        }
        lines
    }

    /// Flush whatever is left after end of stream.
    pub fn finish(&mut self) -> Option<String> {
        self.after_cr = false;
        let line = decode(&self.partial);
        self.partial.clear();
        line
    }

    fn emit(&mut self, lines: &mut Vec<String>) {
        if let Some(line) = decode(&self.partial) {
            lines.push(line);
        }
        self.partial.clear();
    }
}

fn decode(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    if text.trim().is_empty() {
        None
    } else {
        Some(text.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_lines_are_joined_across_chunks() {
        let mut s = LineSplitter::new();
        assert!(s.push(b"Epoch 1/3 ").is_empty());
        assert_eq!(s.push(b"Loss: 0.5\nnext"), vec!["Epoch 1/3 Loss: 0.5"]);
        assert_eq!(s.push(b" line\n"), vec!["next line"]);
        assert!(s.finish().is_none());
    }

    #[test]
    fn trailing_partial_line_is_flushed() {
        let mut s = LineSplitter::new();
        assert_eq!(s.push(b"a\nb"), vec!["a"]);
        assert_eq!(s.finish().as_deref(), Some("b"));
    }

    #[test]
    fn crlf_and_blank_lines() {
        let mut s = LineSplitter::new();
        assert_eq!(s.push(b"one\r\n\r\n  \ntwo\r\n"), vec!["one", "two"]);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut s = LineSplitter::new();
        let lines = s.push(b"loss \xff\n");
        assert_eq!(lines, vec!["loss \u{fffd}"]);
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        let mut s = LineSplitter::new();
        let bytes = "ä\n".as_bytes();
        assert!(s.push(&bytes[..1]).is_empty());
        assert_eq!(s.push(&bytes[1..]), vec!["ä"]);
    }

    #[test]
    fn carriage_returns_end_progress_updates() {
        let mut s = LineSplitter::new();
        let lines = s.push(b"10%|# | loss: 0.9\r20%|## | loss: 0.8\r30%|### | loss: 0.7\r");
        assert_eq!(
            lines,
            vec!["10%|# | loss: 0.9", "20%|## | loss: 0.8", "30%|### | loss: 0.7"]
        );
        assert!(s.finish().is_none());
    }

    #[test]
    fn crlf_split_across_chunks_is_one_break() {
        let mut s = LineSplitter::new();
        assert_eq!(s.push(b"a\r"), vec!["a"]);
        assert_eq!(s.push(b"\nb\n"), vec!["b"]);
    }

    #[test]
    fn oversized_line_is_split_at_the_limit() {
        let mut s = LineSplitter::with_max_line(8);
        let lines = s.push(b"0123456789abcdefXY\nz\n");
        assert_eq!(lines, vec!["01234567", "89abcdef", "XY", "z"]);
    }

    #[test]
    fn unterminated_output_is_bounded() {
        let mut s = LineSplitter::new();
        let blob = vec![b'x'; MAX_LINE_BYTES * 3 + 5];
        let lines = s.push(&blob);
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| l.len() == MAX_LINE_BYTES));
        assert_eq!(s.finish().map(|l| l.len()), Some(5));
    }
}
