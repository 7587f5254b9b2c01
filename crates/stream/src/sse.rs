//! Incremental Server-Sent Events decoder.
//!
//! Bytes arrive in arbitrary chunks; [`SseDecoder::feed`] buffers partial
//! lines and emits a [`SseEvent`] for every completed event. Only the
//! `data` field and comment lines matter to the progress channel;
//! `event`, `id` and `retry` fields are accepted and ignored.

/// One decoded unit of an SSE stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// The joined `data:` lines of one event.
    Data(String),
    /// A comment line (`: keepalive`), with the leading colon removed.
    Comment(String),
}

/// Line-buffering SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line_buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of bytes and return every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        self.line_buffer.extend_from_slice(chunk);

        while let Some(newline_index) = self.line_buffer.iter().position(|byte| *byte == b'\n') {
            let mut line = self.line_buffer.drain(..=newline_index).collect::<Vec<_>>();
            line.pop();
            if matches!(line.last(), Some(b'\r')) {
                line.pop();
            }
            self.process_line(&String::from_utf8_lossy(&line), &mut events);
        }

        events
    }

    /// Flush at end of stream.
    ///
    /// A trailing line without a newline is processed, but an event that was
    /// never terminated by a blank line is discarded.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            self.process_line(&String::from_utf8_lossy(&line), &mut events);
        }
        self.data_lines.clear();
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if !self.data_lines.is_empty() {
                events.push(SseEvent::Data(self.data_lines.join("\n")));
                self.data_lines.clear();
            }
            return;
        }

        if let Some(comment) = line.strip_prefix(':') {
            events.push(SseEvent::Comment(comment.trim_start().to_string()));
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        if field == "data" {
            self.data_lines.push(value.to_string());
        }
    }
}
