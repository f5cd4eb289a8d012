// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory log ring buffer plus optional file append.
//!
//! A `tracing` layer formats each event into one line, keeps the last
//! [`LOG_RING_CAPACITY`] lines for `GET /mcp/log`, and appends to the file
//! named by `LM_TOOLS_BRIDGE_MANAGER_LOG` when set.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Lines retained for the `/mcp/log` tail.
pub const LOG_RING_CAPACITY: usize = 200;

struct LogBufferInner {
    lines: VecDeque<String>,
    capacity: usize,
    file: Option<File>,
}

/// Shared handle to the ring buffer.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<LogBufferInner>>,
}

impl LogBuffer {
    pub fn new(file_path: Option<&Path>) -> Self {
        Self::with_capacity(LOG_RING_CAPACITY, file_path)
    }

    pub fn with_capacity(capacity: usize, file_path: Option<&Path>) -> Self {
        let file = file_path.and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
        Self {
            inner: Arc::new(Mutex::new(LogBufferInner {
                lines: VecDeque::with_capacity(capacity),
                capacity,
                file,
            })),
        }
    }

    /// Append one line, evicting the oldest at capacity.
    pub fn push(&self, line: String) {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.as_mut() {
            let _ = writeln!(file, "{line}");
        }
        if inner.lines.len() == inner.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line);
    }

    /// The most recent `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let inner = self.inner.lock();
        let skip = inner.lines.len().saturating_sub(n);
        inner.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().lines.is_empty()
    }

    /// Layer to hang into the tracing registry.
    pub fn layer(&self) -> LogBufferLayer {
        LogBufferLayer { buf: self.clone() }
    }
}

/// `tracing` layer feeding a [`LogBuffer`].
pub struct LogBufferLayer {
    buf: LogBuffer,
}

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let mut line = format!("{:>5} {}", meta.level().as_str(), meta.target());
        if !visitor.message.is_empty() {
            let _ = write!(line, " {}", visitor.message);
        }
        if !visitor.fields.is_empty() {
            let _ = write!(line, " {}", visitor.fields);
        }
        self.buf.push(line);
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            if !self.fields.is_empty() {
                self.fields.push(' ');
            }
            let _ = write!(self.fields, "{}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            if !self.fields.is_empty() {
                self.fields.push(' ');
            }
            let _ = write!(self.fields, "{}={}", field.name(), value);
        }
    }
}

#[cfg(test)]
#[path = "logbuf_tests.rs"]
mod tests;
