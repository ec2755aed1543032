//! Resumable record framing for backend stdout.
//!
//! Both backends write one JSON document per line, but a line can arrive split
//! across any number of pipe reads. The framer keeps whatever has not yet been
//! terminated and picks up where it left off on the next chunk.

use serde_json::Value;

/// Upper bound for a single buffered record.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Json(Value),
    /// A complete line that is not JSON (banners, warnings, stray prints).
    Text(String),
}

#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
    pending_json: String,
    max_record_bytes: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORD_BYTES)
    }
}

impl LineFramer {
    pub fn new(max_record_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            pending_json: String::new(),
            max_record_bytes,
        }
    }

    /// Feeds one chunk and returns every record it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Record> {
        self.buf.extend_from_slice(chunk);
        let mut records = Vec::new();
        let mut start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.buf[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            let line = self.buf[start..=end].to_vec();
            self.accept_line(&line, &mut records);
            start = end + 1;
            search_from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_record_bytes {
            tracing::warn!(
                bytes = self.buf.len(),
                "dropping oversized unterminated record"
            );
            self.buf.clear();
            self.scanned = 0;
        }
        records
    }

    /// Flushes whatever is left at end of stream.
    pub fn finish(&mut self) -> Vec<Record> {
        let mut records = Vec::new();
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.scanned = 0;
            self.accept_line(&line, &mut records);
        }
        if !self.pending_json.is_empty() {
            records.push(Record::Text(std::mem::take(&mut self.pending_json)));
        }
        records
    }

    /// Bytes held back waiting for more input.
    pub fn buffered_len(&self) -> usize {
        self.buf.len() + self.pending_json.len()
    }

    fn accept_line(&mut self, raw: &[u8], records: &mut Vec<Record>) {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();
        if line.is_empty() {
            return;
        }

        if !self.pending_json.is_empty() {
            // A complete record ends any stale partial document before it.
            if let Some(value) = parse_complete(line) {
                records.push(Record::Text(std::mem::take(&mut self.pending_json)));
                records.push(Record::Json(value));
                return;
            }
            self.pending_json.push_str(line);
            match serde_json::from_str::<Value>(&self.pending_json) {
                Ok(value) => {
                    self.pending_json.clear();
                    records.push(Record::Json(value));
                }
                Err(err) if err.is_eof() && self.pending_json.len() <= self.max_record_bytes => {}
                Err(_) => {
                    records.push(Record::Text(std::mem::take(&mut self.pending_json)));
                }
            }
            return;
        }

        if !(line.starts_with('{') || line.starts_with('[')) {
            records.push(Record::Text(line.to_string()));
            return;
        }

        match serde_json::from_str::<Value>(line) {
            Ok(value) => records.push(Record::Json(value)),
            // A pretty-printed or wrapped document; keep accumulating.
            Err(err) if err.is_eof() => self.pending_json.push_str(line),
            Err(_) => records.push(Record::Text(line.to_string())),
        }
    }
}

fn parse_complete(line: &str) -> Option<Value> {
    if !(line.starts_with('{') || line.starts_with('[')) {
        return None;
    }
    serde_json::from_str(line).ok()
}
