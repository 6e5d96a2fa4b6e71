//! Incremental decoding of streamed chat completions.

use futures::{Stream, StreamExt};

use crate::error::{PersonaError, Result};

/// One server-sent event payload from a completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into `data:` events. Lines (and UTF-8 sequences) may
/// be split across network chunks, so bytes are buffered until a newline.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(raw: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\n', '\r']);
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    if data.is_empty() {
        return None;
    }
    Some(SseEvent::Data(data.to_string()))
}

/// Accumulates content fragments in arrival order.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    content: String,
    fragments: usize,
    finished: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absent fragments count as empty.
    pub fn push(&mut self, fragment: Option<&str>) {
        self.fragments += 1;
        if let Some(text) = fragment {
            self.content.push_str(text);
        }
    }

    pub fn mark_finished(&mut self) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// The assembled reply, or a backend error if the stream never signalled
    /// completion.
    pub fn finish(self) -> Result<String> {
        if !self.finished {
            return Err(PersonaError::Backend(format!(
                "stream closed before completion after {} fragments",
                self.fragments
            )));
        }
        Ok(self.content)
    }
}

/// Drain a fragment stream into one string. The end of the stream is the
/// completion signal; the first error aborts assembly.
pub async fn collect_fragments<S>(fragments: S) -> Result<String>
where
    S: Stream<Item = Result<Option<String>>>,
{
    let mut assembler = StreamAssembler::new();
    futures::pin_mut!(fragments);
    while let Some(fragment) = fragments.next().await {
        assembler.push(fragment?.as_deref());
    }
    assembler.mark_finished();
    assembler.finish()
}
