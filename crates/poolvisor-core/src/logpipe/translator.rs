// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Line splitting writer.

use std::io::{self, Write};
use std::sync::Arc;

use super::record::{LogRecord, Pipe};
use super::sink::RecordSink;

/// Writer that turns a byte stream into one record per line.
///
/// Lines are split on `\n` and a trailing `\r` is dropped. Bytes are
/// buffered until a full line is available, so the records produced never
/// depend on how the stream was chunked. Invalid UTF-8 is replaced per
/// complete line.
///
/// `flush` never emits a partial line. Call [`finish`](Self::finish) when
/// the stream closes to emit the unterminated remainder.
pub struct LogRecordTranslator {
    pipe: Pipe,
    sink: Arc<dyn RecordSink>,
    pending: Vec<u8>,
}

impl LogRecordTranslator {
    /// Create a translator for `pipe` forwarding into `sink`.
    pub fn new(pipe: Pipe, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            pipe,
            sink,
            pending: Vec::new(),
        }
    }

    /// Pipe this translator reads from.
    pub fn pipe(&self) -> Pipe {
        self.pipe
    }

    /// Number of buffered bytes not yet terminated by a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Emit the buffered unterminated line, if any.
    ///
    /// An empty remainder produces no record.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let line = std::mem::take(&mut self.pending);
        self.emit_line(&line)
    }

    fn emit_line(&self, line: &[u8]) -> io::Result<()> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let text = String::from_utf8_lossy(line);
        self.sink.emit(self.pipe, LogRecord::parse(&text))
    }
}

impl Write for LogRecordTranslator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];
            if self.pending.is_empty() {
                self.emit_line(head)?;
            } else {
                self.pending.extend_from_slice(head);
                let line = std::mem::take(&mut self.pending);
                self.emit_line(&line)?;
            }
        }
        self.pending.extend_from_slice(rest);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
