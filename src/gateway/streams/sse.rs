//! Usage: Upstream SSE line splitting and the `new_message` frame sent to callers.

use crate::shared::constants::{SSE_EVENT_NAME, SSE_RETRY_MILLIS};
use axum::body::Bytes;
use serde::Serialize;

/// Splits a chunked byte stream into lines; a line may straddle chunk boundaries.
#[derive(Debug, Default)]
pub(in crate::gateway) struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub(in crate::gateway) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Trailing bytes left when the upstream closed without a final newline.
    pub(in crate::gateway) fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
        Some(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(in crate::gateway) enum UpstreamLine<'a> {
    Blank,
    Event(&'a str),
    Data(&'a str),
    Other,
}

impl<'a> UpstreamLine<'a> {
    pub(in crate::gateway) fn parse(line: &'a str) -> Self {
        if line.trim().is_empty() {
            return Self::Blank;
        }
        if let Some(data) = line.strip_prefix("data:") {
            return Self::Data(data.trim());
        }
        if let Some(event) = line.strip_prefix("event:") {
            return Self::Event(event.trim());
        }
        Self::Other
    }
}

#[derive(Serialize)]
struct AnswerPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
    finished: bool,
}

pub(in crate::gateway) fn answer_frame(text: &str, finished: bool) -> Bytes {
    let payload = AnswerPayload {
        kind: "answer",
        text,
        finished,
    };
    // Serializing a struct of plain strings and bools cannot fail.
    let data = serde_json::to_string(&payload).unwrap_or_default();
    Bytes::from(format!(
        "id: {}\nevent: {SSE_EVENT_NAME}\ndata: {data}\nretry: {SSE_RETRY_MILLIS}\n\n",
        uuid::Uuid::new_v4()
    ))
}
