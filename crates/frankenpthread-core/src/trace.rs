//! Structured JSONL event trace for the synchronization primitives.
//!
//! Provides:
//! - [`TraceEvent`]: one JSONL record (sequence number, thread, object, event, errno).
//! - [`TraceLevel`]: `off` / `errors` / `all`, read from `FRANKENPTHREAD_TRACE`.
//! - A process-wide sink writing to stderr, or to an in-memory buffer for tests.
//!
//! With tracing off, every hook costs a single relaxed atomic load.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::config::{self, CACHE_UNRESOLVED};
use crate::errno;
use crate::error::{PthreadError, Result};
use crate::thread;

/// How much the trace records.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    #[default]
    Off,
    /// Failed operations plus lifecycle anomalies (lost materialization races,
    /// external-unlock handoffs, cancellation unwinds).
    Errors,
    /// Everything, including init/destroy and contended waits.
    All,
}

impl TraceLevel {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "errors" | "error" | "err" => Self::Errors,
            "all" | "1" | "on" | "debug" => Self::All,
            _ => Self::Off,
        }
    }
}

/// Primitive family an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Mutex,
    Cond,
    Rwlock,
    Barrier,
    Semaphore,
    Spinlock,
    Thread,
}

/// A single trace record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub seq: u64,
    pub tid: u64,
    pub object: ObjectKind,
    /// Handle word of the object, hex encoded.
    pub handle: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TraceEvent {
    #[must_use]
    pub fn new(object: ObjectKind, handle: u64, event: impl Into<String>) -> Self {
        Self {
            seq: SEQ.fetch_add(1, Ordering::Relaxed),
            tid: thread::self_id(),
            object,
            handle: format!("{handle:#018x}"),
            event: event.into(),
            errno: None,
            errno_name: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_errno(mut self, value: i32) -> Self {
        self.errno = Some(value);
        self.errno_name = Some(errno::name(value).to_string());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

enum Sink {
    Stderr,
    Buffer(Vec<String>),
}

static SINK: Mutex<Sink> = Mutex::new(Sink::Stderr);
static SEQ: AtomicU64 = AtomicU64::new(0);

// Atomic cache: 0=unresolved, 1=Off, 2=Errors, 3=All, 255=resolving.
static CACHED_LEVEL: AtomicU8 = AtomicU8::new(CACHE_UNRESOLVED);

const LEVEL_OFF: u8 = 1;
const LEVEL_ERRORS: u8 = 2;
const LEVEL_ALL: u8 = 3;

fn level_to_u8(level: TraceLevel) -> u8 {
    match level {
        TraceLevel::Off => LEVEL_OFF,
        TraceLevel::Errors => LEVEL_ERRORS,
        TraceLevel::All => LEVEL_ALL,
    }
}

fn u8_to_level(v: u8) -> TraceLevel {
    match v {
        LEVEL_ERRORS => TraceLevel::Errors,
        LEVEL_ALL => TraceLevel::All,
        _ => TraceLevel::Off,
    }
}

/// Current trace level (reads `FRANKENPTHREAD_TRACE` on first call).
#[must_use]
pub fn level() -> TraceLevel {
    u8_to_level(config::resolve_cached(
        &CACHED_LEVEL,
        "FRANKENPTHREAD_TRACE",
        |raw| level_to_u8(TraceLevel::from_str_loose(raw)),
        LEVEL_OFF,
    ))
}

/// Override the trace level, returning the previous one.
pub fn set_level(level: TraceLevel) -> TraceLevel {
    let previous = self::level();
    CACHED_LEVEL.store(level_to_u8(level), Ordering::Release);
    previous
}

/// Redirect subsequent events into an in-memory buffer.
pub fn capture_to_buffer() {
    *SINK.lock() = Sink::Buffer(Vec::new());
}

/// Drain the buffered JSONL lines (empty when writing to stderr).
pub fn take_buffer() -> Vec<String> {
    match &mut *SINK.lock() {
        Sink::Buffer(lines) => std::mem::take(lines),
        Sink::Stderr => Vec::new(),
    }
}

/// Route subsequent events back to stderr, discarding any buffered lines.
pub fn emit_to_stderr() {
    *SINK.lock() = Sink::Stderr;
}

#[inline]
pub(crate) fn errors_enabled() -> bool {
    !matches!(level(), TraceLevel::Off)
}

#[inline]
pub(crate) fn all_enabled() -> bool {
    matches!(level(), TraceLevel::All)
}

pub(crate) fn record(event: TraceEvent) {
    let Ok(line) = event.to_jsonl() else {
        return;
    };
    match &mut *SINK.lock() {
        Sink::Buffer(lines) => lines.push(line),
        Sink::Stderr => {
            let _ = writeln!(std::io::stderr().lock(), "{line}");
        }
    }
}

/// Lifecycle or contention event, recorded at level `all`.
pub(crate) fn event(object: ObjectKind, handle: u64, name: &'static str) {
    if all_enabled() {
        record(TraceEvent::new(object, handle, name));
    }
}

/// Anomaly worth seeing at level `errors`.
pub(crate) fn anomaly(
    object: ObjectKind,
    handle: u64,
    name: &'static str,
    details: serde_json::Value,
) {
    if errors_enabled() {
        record(TraceEvent::new(object, handle, name).with_details(details));
    }
}

/// Pass `result` through, recording a failure event for `op` when it is an error.
#[inline]
pub(crate) fn outcome<T>(
    object: ObjectKind,
    handle: u64,
    op: &'static str,
    result: Result<T>,
) -> Result<T> {
    if let Err(err) = &result {
        failure(object, handle, op, *err);
    }
    result
}

fn failure(object: ObjectKind, handle: u64, op: &'static str, err: PthreadError) {
    // Timeouts and contention on try-ops are expected traffic.
    let noisy = matches!(err, PthreadError::TimedOut | PthreadError::Busy);
    if (noisy && all_enabled()) || (!noisy && errors_enabled()) {
        record(
            TraceEvent::new(object, handle, op)
                .with_errno(err.errno())
                .with_details(serde_json::json!({ "error": err.to_string() })),
        );
    }
}
