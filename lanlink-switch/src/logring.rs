//! In-memory ring of recent log events.
//!
//! A `tracing_subscriber` layer keeps the last 1024 info-or-louder
//! events for the admin API, optionally mirroring them to a file.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Events the ring retains before dropping the oldest.
pub const RING_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub level: String,
    pub date: String,
    pub message: String,
}

/// Shared ring storage. Push locks only around the ring mutation.
pub struct LogRing {
    events: Mutex<VecDeque<LogEvent>>,
    file: Option<Mutex<File>>,
}

impl LogRing {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            file: None,
        })
    }

    /// Ring that also appends each event to `path`.
    pub fn with_file(path: &Path) -> std::io::Result<Arc<Self>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Arc::new(Self {
            events: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            file: Some(Mutex::new(file)),
        }))
    }

    fn push(&self, event: LogEvent) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{} {} {}", event.date, event.level, event.message);
            }
        }
        let mut events = self.events.lock().expect("log ring poisoned");
        if events.len() >= RING_CAPACITY {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Most recent events, newest first.
    pub fn snapshot(&self) -> Vec<LogEvent> {
        let events = self.events.lock().expect("log ring poisoned");
        events.iter().rev().cloned().collect()
    }
}

/// Layer feeding the ring from the process-wide subscriber.
pub struct RingLayer {
    ring: Arc<LogRing>,
}

impl RingLayer {
    pub fn new(ring: Arc<LogRing>) -> Self {
        Self { ring }
    }
}

impl<S: Subscriber> Layer<S> for RingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // Debug and trace stay out of the ring.
        if *event.metadata().level() > Level::INFO {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.ring.push(LogEvent {
            level: event.metadata().level().to_string(),
            date: Utc::now().to_rfc3339(),
            message: visitor.into_message(),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn into_message(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.join(" ")
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drops_oldest() {
        let ring = LogRing::new();
        for i in 0..RING_CAPACITY + 10 {
            ring.push(LogEvent {
                level: "INFO".into(),
                date: String::new(),
                message: format!("event {i}"),
            });
        }
        let snap = ring.snapshot();
        assert_eq!(snap.len(), RING_CAPACITY);
        // Newest first; the first ten events fell out.
        assert_eq!(snap[0].message, format!("event {}", RING_CAPACITY + 9));
        assert_eq!(snap.last().unwrap().message, "event 10");
    }

    #[test]
    fn test_file_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switch.log");
        let ring = LogRing::with_file(&path).unwrap();
        ring.push(LogEvent {
            level: "WARN".into(),
            date: "2026-01-01T00:00:00Z".into(),
            message: "bridge down".into(),
        });
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("WARN bridge down"));
    }
}
