//! Incremental rewrite of a Code Assist SSE byte stream.
//!
//! Works on raw bytes so chunk boundaries can fall anywhere, including in the
//! middle of a multi-byte character: only complete lines are inspected, and
//! everything that is not a rewritable `data:` line is forwarded unchanged,
//! terminator included.

use bytes::Bytes;
use serde_json::Value as JsonValue;

#[derive(Debug, Default)]
pub struct SseLineRewriter {
    buffer: Vec<u8>,
    finished: bool,
}

impl SseLineRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one upstream chunk and returns the bytes ready to forward.
    pub fn push(&mut self, chunk: &[u8]) -> Bytes {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::with_capacity(chunk.len());
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let (content, terminator) = split_terminator(&line);
            out.extend_from_slice(&transform_line(content));
            out.extend_from_slice(terminator);
        }
        Bytes::from(out)
    }

    /// Flushes a trailing line that never got its terminator. Idempotent.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        self.finished = true;
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        Some(Bytes::from(transform_line(&line)))
    }
}

fn split_terminator(line: &[u8]) -> (&[u8], &[u8]) {
    if line.ends_with(b"\r\n") {
        (&line[..line.len() - 2], &line[line.len() - 2..])
    } else if line.ends_with(b"\n") {
        (&line[..line.len() - 1], &line[line.len() - 1..])
    } else {
        (line, &[])
    }
}

/// Replaces `data: {"response": ...}` with `data: <inner>`. Any other line
/// (comments, event names, end markers, unparsable payloads) is forwarded
/// byte for byte.
fn transform_line(content: &[u8]) -> Vec<u8> {
    let Some(payload) = content.strip_prefix(b"data:") else {
        return content.to_vec();
    };
    let trimmed = payload.trim_ascii();
    if trimmed.is_empty() {
        return content.to_vec();
    }
    let Ok(parsed) = serde_json::from_slice::<JsonValue>(trimmed) else {
        return content.to_vec();
    };
    let Some(inner) = parsed.get("response") else {
        return content.to_vec();
    };
    match serde_json::to_vec(inner) {
        Ok(encoded) => {
            let mut out = Vec::with_capacity(6 + encoded.len());
            out.extend_from_slice(b"data: ");
            out.extend_from_slice(&encoded);
            out
        }
        Err(_) => content.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite_in_chunks(input: &[u8], chunk_size: usize) -> Vec<u8> {
        let mut rewriter = SseLineRewriter::new();
        let mut out = Vec::new();
        for chunk in input.chunks(chunk_size.max(1)) {
            out.extend_from_slice(&rewriter.push(chunk));
        }
        if let Some(tail) = rewriter.finish() {
            out.extend_from_slice(&tail);
        }
        out
    }

    #[test]
    fn data_lines_are_unwrapped() {
        let input = b"data: {\"response\":{\"candidates\":[1]}}\n\n";
        let out = rewrite_in_chunks(input, input.len());
        assert_eq!(&out[..], b"data: {\"candidates\":[1]}\n\n");
    }

    #[test]
    fn crlf_terminators_are_preserved() {
        let input = b"data: {\"response\":{\"a\":1}}\r\ndata: [DONE]\r\n";
        let out = rewrite_in_chunks(input, input.len());
        assert_eq!(&out[..], b"data: {\"a\":1}\r\ndata: [DONE]\r\n");
    }

    #[test]
    fn non_data_and_unparsable_lines_pass_through() {
        let input = b": keep-alive\nevent: end\ndata: not json\ndata: {\"no_wrap\":1}\n";
        let out = rewrite_in_chunks(input, input.len());
        assert_eq!(&out[..], &input[..]);
    }

    #[test]
    fn chunk_boundaries_do_not_change_the_output() {
        let payload = "data: {\"response\":{\"text\":\"héllo 🌍\"}}\r\n\r\ndata: {\"response\":{\"n\":2}}\n\ndata: [DONE]\n";
        let input = payload.as_bytes();
        let whole = rewrite_in_chunks(input, input.len());
        for chunk_size in 1..=7 {
            assert_eq!(
                rewrite_in_chunks(input, chunk_size),
                whole,
                "chunk size {chunk_size}"
            );
        }
        let expected = "data: {\"text\":\"héllo 🌍\"}\r\n\r\ndata: {\"n\":2}\n\ndata: [DONE]\n";
        assert_eq!(whole, expected.as_bytes());
    }

    #[test]
    fn trailing_partial_line_flushes_exactly_once() {
        let mut rewriter = SseLineRewriter::new();
        let _ = rewriter.push(b"data: {\"response\":{\"tail\":true}}");
        let tail = rewriter.finish().unwrap();
        assert_eq!(&tail[..], b"data: {\"tail\":true}");
        assert_eq!(rewriter.finish(), None);
    }

    #[test]
    fn empty_stream_flushes_nothing() {
        let mut rewriter = SseLineRewriter::new();
        assert_eq!(&rewriter.push(b"")[..], b"");
        assert_eq!(rewriter.finish(), None);
    }
}
