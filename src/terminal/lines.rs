//! Chunk to line decoding for streamed command output.

use std::collections::VecDeque;

use futures_util::{Stream, StreamExt};

/// Folds arbitrarily split chunks into complete lines.
///
/// Lines are split on `\n`; a `\r` directly before it is dropped, so `\r\n`
/// counts as one terminator even when the two bytes arrive in different
/// chunks. Output never depends on where the producer split the stream.
#[derive(Debug, Default)]
pub struct LineDecoder {
    tail: Vec<u8>,
}

impl LineDecoder {
    /// Decoder with an empty tail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line it completed, in order.
    pub fn push(&mut self, chunk: impl AsRef<[u8]>) -> Vec<String> {
        let chunk = chunk.as_ref();
        let mut lines = Vec::new();
        let mut start = 0;

        for (index, byte) in chunk.iter().enumerate() {
            if *byte != b'\n' {
                continue;
            }
            self.tail.extend_from_slice(&chunk[start..index]);
            lines.push(take_line(&mut self.tail));
            start = index + 1;
        }
        self.tail.extend_from_slice(&chunk[start..]);

        lines
    }

    /// Ends the stream. Returns the unterminated remainder if it is not
    /// empty.
    pub fn finish(&mut self) -> Option<String> {
        if self.tail.is_empty() {
            return None;
        }
        let remainder = std::mem::take(&mut self.tail);
        Some(String::from_utf8_lossy(&remainder).into_owned())
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.tail.len()
    }
}

fn take_line(buffer: &mut Vec<u8>) -> String {
    if buffer.last() == Some(&b'\r') {
        buffer.pop();
    }
    let line = String::from_utf8_lossy(buffer).into_owned();
    buffer.clear();
    line
}

/// Decodes a stream of byte chunks into a stream of lines.
///
/// The first chunk error ends the line stream after flushing the remainder;
/// `on_error` observes it.
pub fn decode_lines<S, B, E, F>(chunks: S, on_error: F) -> impl Stream<Item = String>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    F: FnMut(E),
{
    let state = DecodeState {
        chunks: Some(chunks),
        decoder: LineDecoder::new(),
        ready: VecDeque::new(),
        on_error,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.ready.pop_front() {
                return Some((line, state));
            }
            let chunks = state.chunks.as_mut()?;
            match chunks.next().await {
                Some(Ok(chunk)) => {
                    let lines = state.decoder.push(chunk);
                    state.ready.extend(lines);
                }
                Some(Err(err)) => {
                    (state.on_error)(err);
                    state.chunks = None;
                    state.ready.extend(state.decoder.finish());
                }
                None => {
                    state.chunks = None;
                    state.ready.extend(state.decoder.finish());
                }
            }
        }
    })
}

struct DecodeState<S, F> {
    chunks: Option<S>,
    decoder: LineDecoder,
    ready: VecDeque<String>,
    on_error: F,
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::{decode_lines, LineDecoder};

    fn decode_all<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Vec<String> {
        let mut decoder = LineDecoder::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(decoder.push(chunk));
        }
        lines.extend(decoder.finish());
        lines
    }

    #[test]
    fn flush_emits_unterminated_tail() {
        assert_eq!(decode_all([b"a\nb\nc".as_slice()]), vec!["a", "b", "c"]);
    }

    #[test]
    fn flush_skips_empty_tail() {
        assert_eq!(decode_all([b"a\nb\n".as_slice()]), vec!["a", "b"]);
    }

    #[test]
    fn crlf_and_lf_are_both_terminators() {
        assert_eq!(
            decode_all([b"one\r\ntwo\nthree\r\n".as_slice()]),
            vec!["one", "two", "three"]
        );
    }

    #[test]
    fn empty_lines_in_the_middle_are_kept() {
        assert_eq!(
            decode_all([b"a\n\n\nb\n".as_slice()]),
            vec!["a", "", "", "b"]
        );
    }

    #[test]
    fn bare_carriage_return_inside_a_line_is_content() {
        assert_eq!(decode_all([b"50%\r100%\n".as_slice()]), vec!["50%\r100%"]);
    }

    #[test]
    fn output_is_independent_of_chunk_boundaries() {
        let input = "first\r\nsecond\n\nthird \u{00e9}\u{4e16}\r\nlast\rline\r\n\r\ntail";
        let bytes = input.as_bytes();
        let expected = decode_all([bytes]);
        assert_eq!(
            expected,
            vec![
                "first",
                "second",
                "",
                "third \u{00e9}\u{4e16}",
                "last\rline",
                "",
                "tail"
            ]
        );

        for split in 0..=bytes.len() {
            let (left, right) = bytes.split_at(split);
            assert_eq!(decode_all([left, right]), expected, "split at {split}");
        }

        for size in 1..=4 {
            assert_eq!(decode_all(bytes.chunks(size)), expected, "chunk size {size}");
        }
    }

    #[test]
    fn pending_tracks_the_tail() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push("abc").is_empty());
        assert_eq!(decoder.pending(), 3);
        assert_eq!(decoder.push("\n"), vec!["abc"]);
        assert_eq!(decoder.pending(), 0);
        assert_eq!(decoder.finish(), None);
    }

    #[tokio::test]
    async fn stream_adapter_flushes_on_error() {
        let chunks = futures_util::stream::iter(vec![
            Ok::<_, &str>(b"hello\nwor".to_vec()),
            Ok(b"ld".to_vec()),
            Err("connection reset"),
            Ok(b"\nnever".to_vec()),
        ]);
        let mut errors = Vec::new();
        let lines: Vec<String> = decode_lines(chunks, |err| errors.push(err))
            .collect()
            .await;

        assert_eq!(lines, vec!["hello", "world"]);
        assert_eq!(errors, vec!["connection reset"]);
    }
}
