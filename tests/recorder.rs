//! Integration tests for recording, merge-dump ordering, tracing and the
//! signal-triggered dump.
//!
//! The dump hooks are process-global, so every test that touches them runs
//! under a shared lock and captures output through a sink function instead
//! of standard error.

use std::ffi::c_void;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use flightrec::{record, recorder, trace_set, TraceStatus};

recorder!(SINGLE, "itest_single", 8, "single thread ordering");
recorder!(MERGE_A, "itest_merge_a", 8, "merge test recorder a");
recorder!(MERGE_B, "itest_merge_b", 8, "merge test recorder b");
recorder!(OVERRUN, "itest_overrun", 4, "overrun test recorder");
recorder!(FLOAT, "itest_float", 8, "float recovery recorder");
recorder!(GATED, "itest_gate", 8, "trace gating recorder");
recorder!(BACKGROUND, "itest_background", 32, "background dump recorder");
recorder!(PHASED, "itest_phased", 512, "cross thread ordering");
recorder!(SIGNALLED, "itest_signalled", 16, "signal dump recorder");

static TEST_LOCK: Mutex<()> = Mutex::new(());
static SINK: Mutex<Vec<u8>> = Mutex::new(Vec::new());

fn lock() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn capture_show(buf: &[u8], _output: *mut c_void) -> usize {
    SINK.lock().unwrap().extend_from_slice(buf);
    buf.len()
}

/// Run `f` with dump output captured into a string. Caller holds the lock.
fn with_capture<F: FnOnce()>(f: F) -> String {
    SINK.lock().unwrap().clear();
    let prev = flightrec::configure_show(capture_show);
    f();
    flightrec::configure_show(prev);
    let bytes = SINK.lock().unwrap().clone();
    String::from_utf8(bytes).unwrap()
}

fn lines_for<'a>(out: &'a str, label: &str) -> Vec<&'a str> {
    let tag = format!("] {label}: ");
    out.lines().filter(|l| l.contains(&tag)).collect()
}

/// Extract the global order from a `loc: [order secs] label: msg` line.
fn order_of(line: &str) -> u64 {
    let open = line.find('[').expect("no order bracket");
    let rest = &line[open + 1..];
    let end = rest.find(' ').expect("no order field");
    rest[..end].parse().expect("order not a number")
}

fn message_of(line: &str) -> &str {
    line.rsplit_once(": ").expect("no message").1
}

#[test]
fn test_single_thread_order() {
    let _g = lock();
    record!(SINGLE, "%s %d", c"a", 1);
    record!(SINGLE, "%s %d", c"b", 2);
    record!(SINGLE, "%s %d", c"c", 3);
    let out = with_capture(|| {
        assert_eq!(flightrec::dump_for("itest_single"), 3);
    });
    let lines = lines_for(&out, "itest_single");
    assert_eq!(lines.len(), 3);
    assert_eq!(message_of(lines[0]), "a 1");
    assert_eq!(message_of(lines[1]), "b 2");
    assert_eq!(message_of(lines[2]), "c 3");
    assert!(order_of(lines[0]) < order_of(lines[1]));
    assert!(order_of(lines[1]) < order_of(lines[2]));
}

#[test]
fn test_cross_recorder_merge() {
    let _g = lock();
    record!(MERGE_A, "%s", c"x");
    record!(MERGE_B, "%s", c"y");
    record!(MERGE_A, "%s", c"z");
    let out = with_capture(|| {
        assert_eq!(flightrec::dump_for("itest_merge_.*"), 3);
    });
    let merged: Vec<&str> = out
        .lines()
        .filter(|l| l.contains("] itest_merge_"))
        .map(message_of)
        .collect();
    assert_eq!(merged, ["x", "y", "z"]);
}

#[test]
fn test_overrun_keeps_newest() {
    let _g = lock();
    for i in 0..10 {
        record!(OVERRUN, "%d", i);
    }
    let out = with_capture(|| {
        assert!(flightrec::dump_for("itest_overrun") <= 4);
    });
    let lines = lines_for(&out, "itest_overrun");
    assert!(lines.len() <= 4);
    assert_eq!(message_of(*lines.last().unwrap()), "9");
}

#[test]
fn test_float_recovery() {
    let _g = lock();
    record!(FLOAT, "%.2f", 1.5f64);
    let out = with_capture(|| {
        assert_eq!(flightrec::dump_for("itest_float"), 1);
    });
    let lines = lines_for(&out, "itest_float");
    assert_eq!(message_of(lines[0]), "1.50");
}

#[test]
fn test_trace_prints_synchronously_until_disabled() {
    let _g = lock();
    // Register before the directive can match the name.
    GATED.get();
    let out = with_capture(|| {
        assert_eq!(trace_set("itest_gate=1"), TraceStatus::Ok);
        record!(GATED, "%s", c"visible");
        assert_eq!(trace_set("itest_gate=0"), TraceStatus::Ok);
        record!(GATED, "%s", c"silent");
    });
    let lines = lines_for(&out, "itest_gate");
    assert_eq!(lines.len(), 1);
    assert_eq!(message_of(lines[0]), "visible");
    // Both entries are still in the ring for a later dump.
    let out = with_capture(|| {
        assert_eq!(flightrec::dump_for("itest_gate"), 2);
    });
    assert_eq!(lines_for(&out, "itest_gate").len(), 2);
}

#[test]
fn test_dump_for_unmatched_pattern_is_empty() {
    let _g = lock();
    let out = with_capture(|| {
        assert_eq!(flightrec::dump_for("no_such_recorder_anywhere"), 0);
    });
    assert!(out.is_empty());
}

#[test]
fn test_background_dump_drains() {
    let _g = lock();
    assert_eq!(trace_set("recorder_dump_sleep=10"), TraceStatus::Ok);
    SINK.lock().unwrap().clear();
    let prev = flightrec::configure_show(capture_show);
    flightrec::background_dump("itest_background");
    for i in 0..3 {
        record!(BACKGROUND, "tick %d", i);
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let drained = {
            let sink = SINK.lock().unwrap();
            let out = String::from_utf8_lossy(&sink).into_owned();
            lines_for(&out, "itest_background").len()
        };
        if drained >= 3 || Instant::now() > deadline {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    flightrec::background_dump_stop();
    flightrec::configure_show(prev);
    let out = String::from_utf8(SINK.lock().unwrap().clone()).unwrap();
    assert_eq!(lines_for(&out, "itest_background").len(), 3);
}

#[test]
fn test_order_respects_cross_thread_happens_before() {
    let _g = lock();
    let first = thread::spawn(|| {
        for i in 0..100 {
            record!(PHASED, "first %d", i);
        }
    });
    first.join().unwrap();
    // Everything below happens after the join, so it must order later.
    let second = thread::spawn(|| {
        for i in 0..100 {
            record!(PHASED, "second %d", i);
        }
    });
    second.join().unwrap();

    let out = with_capture(|| {
        assert_eq!(flightrec::dump_for("itest_phased"), 200);
    });
    let lines = lines_for(&out, "itest_phased");
    assert_eq!(lines.len(), 200);
    let mut last_order = None;
    for line in &lines {
        let order = order_of(line);
        if let Some(prev) = last_order {
            assert!(order > prev, "merge must be sorted by order");
        }
        last_order = Some(order);
    }
    assert!(lines[..100].iter().all(|l| message_of(l).starts_with("first")));
    assert!(lines[100..].iter().all(|l| message_of(l).starts_with("second")));
}

#[test]
fn test_configure_output_returns_previous() {
    let _g = lock();
    let marker = 0x1234usize as *mut c_void;
    let prev = flightrec::configure_output(marker);
    let back = flightrec::configure_output(prev);
    assert_eq!(back, marker);
}

#[test]
fn test_signal_dump() {
    let _g = lock();
    for i in 0..5 {
        record!(SIGNALLED, "sig event %d", i);
    }
    let out = with_capture(|| {
        flightrec::dump_on_signal(libc::SIGUSR1);
        unsafe { libc::raise(libc::SIGUSR1) };
    });
    // The handler dumped everything pending, our five entries included.
    let lines = lines_for(&out, "itest_signalled");
    assert_eq!(lines.len(), 5);
    for (i, line) in lines.iter().enumerate() {
        assert_eq!(message_of(line), format!("sig event {i}"));
    }
    // The library's own signal recorder saw the delivery.
    assert!(out.contains("] signals: "));
}
