//! Event records and their emission.
//!
//! Components report notable occurrences as [`EventRecord`]s: mirrored to
//! `tracing` at a level matching the severity, then forwarded out of the
//! component's log port when it is connected.

use crate::component::PortContext;
use crate::port::PortArgs;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

pub const MAX_EVENT_TEXT: usize = 120;

pub type EventText = ArrayString<MAX_EVENT_TEXT>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Diagnostic,
    ActivityLo,
    ActivityHi,
    Command,
    WarningLo,
    WarningHi,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: u32,
    pub severity: Severity,
    pub source: String,
    pub text: EventText,
    pub timestamp_ms: u64,
}

impl EventRecord {
    pub fn new(id: u32, severity: Severity, source: &str, text: &str) -> Self {
        Self {
            id,
            severity,
            source: source.to_string(),
            text: bounded_text(text),
            timestamp_ms: now_ms(),
        }
    }
}

/// Copies as much of `text` as fits, on a character boundary.
pub fn bounded_text(text: &str) -> EventText {
    let mut bounded = EventText::new();
    for ch in text.chars() {
        if bounded.try_push(ch).is_err() {
            break;
        }
    }
    bounded
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Logs `record` through `tracing` and sends it out of `port` if connected.
///
/// Delivery failures are traced and otherwise ignored; an event must never
/// take the emitting handler down with it.
pub fn emit(ctx: &PortContext<'_>, port: usize, record: EventRecord) {
    match record.severity {
        Severity::Fatal => error!(source = %record.source, id = record.id, "{}", record.text),
        Severity::WarningHi | Severity::WarningLo => {
            warn!(source = %record.source, id = record.id, "{}", record.text);
        }
        Severity::Command | Severity::ActivityHi | Severity::ActivityLo => {
            info!(source = %record.source, id = record.id, "{}", record.text);
        }
        Severity::Diagnostic => debug!(source = %record.source, id = record.id, "{}", record.text),
    }

    if !ctx.is_connected(port, 0) {
        return;
    }
    if let Err(e) = ctx.invoke(port, 0, PortArgs::Log(record)) {
        warn!(source = ctx.name(), error = %e, "event delivery failed");
    }
}
