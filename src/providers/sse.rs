use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use super::{LineStream, ProviderError};

/// Line framer for SSE bodies. Network chunks do not align with event
/// boundaries, so the framer keeps a rolling byte buffer and emits only
/// complete lines. Accepts `\r\n`, `\n` and `\r` terminators; blank lines
/// are dropped.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < self.buf.len() {
            match self.buf[i] {
                b'\n' => {
                    push_line(&mut lines, &self.buf[start..i]);
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    // A \r as the final buffered byte is ambiguous (the \n
                    // half of \r\n may be in the next chunk); hold the line.
                    if i + 1 == self.buf.len() {
                        break;
                    }
                    push_line(&mut lines, &self.buf[start..i]);
                    i += if self.buf[i + 1] == b'\n' { 2 } else { 1 };
                    start = i;
                }
                _ => i += 1,
            }
        }
        self.buf.drain(..start);

        lines
    }

    /// Flush any non-empty trailing line at end-of-stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        let rest = std::mem::take(&mut self.buf);
        if rest.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&rest).into_owned())
        }
    }
}

fn push_line(lines: &mut Vec<String>, segment: &[u8]) {
    if !segment.is_empty() {
        lines.push(String::from_utf8_lossy(segment).into_owned());
    }
}

struct FramerState {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    framer: LineFramer,
    pending: VecDeque<String>,
    done: bool,
}

/// Adapt an upstream byte stream into a stream of SSE text lines.
pub fn sse_line_stream<S>(bytes: S) -> LineStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = FramerState {
        inner: Box::pin(bytes),
        framer: LineFramer::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(line) = st.pending.pop_front() {
                return Some((Ok(line), st));
            }
            if st.done {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.pending.extend(st.framer.push(&chunk)),
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(ProviderError::Http(e)), st));
                }
                None => {
                    st.done = true;
                    st.pending.extend(st.framer.finish());
                }
            }
        }
    }))
}
