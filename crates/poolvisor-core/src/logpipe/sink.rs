// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record sinks.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::info;

use super::record::{LogRecord, Pipe};
use crate::metrics::Metrics;

/// Destination for translated records.
///
/// One sink is shared by the stdout and stderr translators, so
/// implementations must be thread-safe. Returning an error aborts copying
/// from the stream that produced the record.
pub trait RecordSink: Send + Sync {
    /// Accept one record read from `pipe`.
    fn emit(&self, pipe: Pipe, record: LogRecord) -> io::Result<()>;
}

/// Sink that forwards records as `tracing` events.
///
/// Events use target `pgbouncer` and message `"record"`, with the record
/// serialized to JSON in the `record` field.
#[derive(Default, Clone)]
pub struct TracingSink {
    metrics: Option<Metrics>,
}

impl TracingSink {
    /// Create a sink without metric accounting.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count every emitted record in `poolvisor_log_records_total`.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl RecordSink for TracingSink {
    fn emit(&self, pipe: Pipe, record: LogRecord) -> io::Result<()> {
        let json = serde_json::to_string(&record).map_err(io::Error::other)?;
        info!(target: "pgbouncer", pipe = %pipe, record = %json, "record");
        if let Some(metrics) = &self.metrics {
            metrics.record_log_line(pipe, record.matched);
        }
        Ok(())
    }
}

/// In-memory sink collecting records in arrival order.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<(Pipe, LogRecord)>>,
    failing: AtomicBool,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink that rejects every record.
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.set_failing(true);
        sink
    }

    /// Toggle rejection of subsequent records.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All records received so far, tagged with their pipe.
    pub fn records(&self) -> Vec<(Pipe, LogRecord)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records received from one pipe, in order.
    pub fn records_for(&self, pipe: Pipe) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(p, _)| *p == pipe)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Number of records received.
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no record has been received.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordSink for MemorySink {
    fn emit(&self, pipe: Pipe, record: LogRecord) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory sink is rejecting records",
            ));
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((pipe, record));
        Ok(())
    }
}
