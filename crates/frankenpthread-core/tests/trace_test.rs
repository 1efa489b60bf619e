//! The trace sink and level are process-global; every test holds `TRACE_GUARD`.

use frankenpthread_core::trace::{self, TraceLevel};
use frankenpthread_core::{Mutex, MutexKind, Semaphore};

static TRACE_GUARD: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

struct Capture {
    previous: TraceLevel,
}

impl Capture {
    fn start(level: TraceLevel) -> Self {
        trace::capture_to_buffer();
        Self {
            previous: trace::set_level(level),
        }
    }

    fn lines(&self) -> Vec<serde_json::Value> {
        trace::take_buffer()
            .iter()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        trace::set_level(self.previous);
        trace::emit_to_stderr();
    }
}

#[test]
fn failed_unlock_is_recorded_with_errno_fields() {
    let _guard = TRACE_GUARD.lock();
    let cap = Capture::start(TraceLevel::Errors);

    let m = Mutex::init(MutexKind::ErrorCheck).unwrap();
    let handle = m.handle();
    assert!(m.unlock().is_err());

    let lines = cap.lines();
    let ev = lines
        .iter()
        .find(|v| v["event"] == "unlock")
        .expect("unlock failure recorded");
    assert_eq!(ev["object"], "mutex");
    assert_eq!(ev["handle"], format!("{handle:#018x}"));
    assert_eq!(ev["errno"], 1);
    assert_eq!(ev["errno_name"], "EPERM");
    assert_eq!(ev["tid"], frankenpthread_core::thread::self_id());
    assert!(ev["seq"].is_u64());
    assert!(ev["details"]["error"].is_string());
}

#[test]
fn errors_level_skips_expected_contention() {
    let _guard = TRACE_GUARD.lock();
    let cap = Capture::start(TraceLevel::Errors);

    let s = Semaphore::init(0, 1).unwrap();
    assert!(s.trywait().is_err());
    assert!(cap.lines().is_empty());

    trace::set_level(TraceLevel::All);
    assert!(s.trywait().is_err());
    let lines = cap.lines();
    let ev = lines
        .iter()
        .find(|v| v["event"] == "trywait")
        .expect("busy trywait recorded at level all");
    assert_eq!(ev["object"], "semaphore");
    assert_eq!(ev["errno_name"], "EBUSY");
}

#[test]
fn off_records_nothing_and_sequence_numbers_increase() {
    let _guard = TRACE_GUARD.lock();
    let cap = Capture::start(TraceLevel::Off);
    let m = Mutex::init(MutexKind::ErrorCheck).unwrap();
    assert!(m.unlock().is_err());
    assert!(cap.lines().is_empty());

    trace::set_level(TraceLevel::Errors);
    assert!(m.unlock().is_err());
    assert!(m.unlock().is_err());
    let seqs: Vec<u64> = cap
        .lines()
        .iter()
        .map(|v| v["seq"].as_u64().unwrap())
        .collect();
    assert!(seqs.len() >= 2);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}
