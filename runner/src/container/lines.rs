use crate::logs::{decode_line, StreamKind};

/// Rebuilds lines from engine frames. Frames may split or join lines
/// arbitrarily; each stream keeps its own pending bytes.
#[derive(Debug, Default)]
pub struct LineAssembler {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame and return the lines it completed.
    pub fn push(&mut self, stream: StreamKind, bytes: &[u8]) -> Vec<String> {
        let pending = self.pending(stream);
        pending.extend_from_slice(bytes);

        let Some(last_newline) = pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = pending.split_off(last_newline + 1);
        let complete = std::mem::replace(pending, rest);

        complete
            .split_inclusive(|b| *b == b'\n')
            .map(decode_line)
            .collect()
    }

    /// Drain unterminated output left when the streams end.
    pub fn finish(&mut self) -> Vec<(StreamKind, String)> {
        [StreamKind::Stdout, StreamKind::Stderr]
            .into_iter()
            .filter_map(|stream| {
                let pending = std::mem::take(self.pending(stream));
                (!pending.is_empty()).then(|| (stream, decode_line(&pending)))
            })
            .collect()
    }

    fn pending(&mut self, stream: StreamKind) -> &mut Vec<u8> {
        match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_span_frame_boundaries() {
        let mut lines = LineAssembler::new();

        assert!(lines.push(StreamKind::Stdout, b"hel").is_empty());
        assert_eq!(lines.push(StreamKind::Stdout, b"lo\nwor"), vec!["hello"]);
        assert_eq!(
            lines.push(StreamKind::Stdout, b"ld\n\nlast"),
            vec!["world", ""]
        );
        assert_eq!(
            lines.finish(),
            vec![(StreamKind::Stdout, "last".to_string())]
        );
        assert!(lines.finish().is_empty());
    }

    #[test]
    fn streams_are_buffered_independently() {
        let mut lines = LineAssembler::new();

        assert!(lines.push(StreamKind::Stdout, b"out-").is_empty());
        assert_eq!(lines.push(StreamKind::Stderr, b"err\r\n"), vec!["err"]);
        assert_eq!(lines.push(StreamKind::Stdout, b"1\n"), vec!["out-1"]);
    }

    #[test]
    fn one_frame_may_hold_many_lines() {
        let mut lines = LineAssembler::new();
        assert_eq!(
            lines.push(StreamKind::Stderr, b"a\nb\nc\n"),
            vec!["a", "b", "c"]
        );
        assert!(lines.finish().is_empty());
    }
}
