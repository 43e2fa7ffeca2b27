//! Incremental server-sent events decoder.
//!
//! Bytes may arrive split at arbitrary boundaries; the decoder buffers them,
//! cuts complete lines, and assembles `event:`/`data:`/`id:` fields into
//! frames terminated by a blank line. Comment lines and unknown fields are
//! ignored, and CRLF line endings are accepted. A line that grows past the
//! configured limit without a terminator is dropped together with the frame
//! it belonged to.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tracing::warn;

/// Event name the SSE protocol assigns to frames without an `event:` field.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// Default cap on a single unterminated line.
pub const DEFAULT_MAX_LINE_LEN: usize = 8 * 1024 * 1024;

/// One decoded server-sent event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseFrame {
    pub fn event_name(&self) -> &str {
        self.event.as_deref().unwrap_or(DEFAULT_EVENT_NAME)
    }
}

pub struct SseDecoder<S> {
    body: S,
    buffer: BytesMut,
    // Bytes of `buffer` already searched for a newline.
    scanned: usize,
    max_line_len: usize,
    discarding: bool,
    pending: SseFrame,
    pending_has_data: bool,
    ready: VecDeque<SseFrame>,
    last_event_id: Option<String>,
    finished: bool,
}

impl<S, E> SseDecoder<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    pub fn new(body: S) -> Self {
        Self {
            body,
            buffer: BytesMut::with_capacity(1024),
            scanned: 0,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            discarding: false,
            pending: SseFrame::default(),
            pending_has_data: false,
            ready: VecDeque::new(),
            last_event_id: None,
            finished: false,
        }
    }

    pub fn with_max_line_len(mut self, max_line_len: usize) -> Self {
        self.max_line_len = max_line_len;
        self
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reads until the next complete frame.
    ///
    /// Returns `None` once the body ends; a trailing frame that was never
    /// terminated by a blank line is discarded.
    pub async fn next_frame(&mut self) -> Option<Result<SseFrame, E>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(Ok(frame));
            }
            if self.finished {
                return None;
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.append(chunk),
                Some(Err(err)) => return Some(Err(err)),
                None => self.finished = true,
            }
        }
    }

    fn append(&mut self, chunk: Bytes) {
        let mut chunk = &chunk[..];
        if self.discarding {
            match chunk.iter().position(|byte| *byte == b'\n') {
                Some(newline) => {
                    self.discarding = false;
                    chunk = &chunk[newline + 1..];
                }
                None => return,
            }
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|byte| *byte == b'\n')
        {
            let newline = self.scanned + offset;
            self.scanned = 0;
            let mut line = self.buffer.split_to(newline + 1);
            line.truncate(newline);
            if line.last() == Some(&b'\r') {
                line.truncate(newline - 1);
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            self.process_line(&line);
        }
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_line_len {
            warn!(
                event = "sse_line_discarded",
                buffered = self.buffer.len(),
                limit = self.max_line_len
            );
            self.buffer.clear();
            self.scanned = 0;
            self.pending = SseFrame::default();
            self.pending_has_data = false;
            self.discarding = true;
        }
    }

    fn process_line(&mut self, line: &str) {
        if line.is_empty() {
            self.dispatch();
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match name {
            "event" => self.pending.event = Some(value.to_string()),
            "data" => {
                if self.pending_has_data {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
                self.pending_has_data = true;
            }
            "id" => {
                self.pending.id = Some(value.to_string());
                self.last_event_id = Some(value.to_string());
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) {
        let frame = std::mem::take(&mut self.pending);
        let has_data = std::mem::replace(&mut self.pending_has_data, false);
        if has_data || frame.event.is_some() {
            self.ready.push_back(frame);
        }
    }
}
