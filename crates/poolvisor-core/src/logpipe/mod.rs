// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log pipe module - turns raw child output into structured records.
//!
//! Each output stream of the supervised process gets its own
//! [`LogRecordTranslator`]. The translator is a [`std::io::Write`] sink that
//! splits incoming bytes into lines, parses every line against PgBouncer's
//! log format and hands one [`LogRecord`] per line to a shared
//! [`RecordSink`].

mod record;
mod sink;
mod translator;

pub use record::{LogRecord, Pipe, RECORD_MESSAGE};
pub use sink::{MemorySink, RecordSink, TracingSink};
pub use translator::LogRecordTranslator;
