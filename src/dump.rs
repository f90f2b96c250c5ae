//! Dump hooks, the global merge, and the background dumper.
//!
//! Output goes through two pluggable function slots: `format` renders one
//! entry into a line, `show` writes bytes to the sink. Both default to a
//! `location: [order seconds] label: message` line on standard error. The
//! slots are plain process-global state, intended to be configured during
//! startup or between dump sessions.

use std::ffi::c_void;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use regex::Regex;

use crate::format::{format_entry_message, Buf};
use crate::recorder::{recorders, Entry, Recorder, TICKS_PER_SEC, TRACE_EXPORTED};

/// Writes a byte range to the sink, returning the bytes written. The opaque
/// argument comes from [`configure_output`].
pub type ShowFn = fn(&[u8], *mut c_void) -> usize;

/// Renders one entry and hands it to `show` exactly once. Arguments:
/// show, output, label, location, order, timestamp, message.
pub type FormatFn = fn(ShowFn, *mut c_void, &str, &str, u64, u64, &[u8]);

static SHOW: AtomicUsize = AtomicUsize::new(0);
static FORMAT: AtomicUsize = AtomicUsize::new(0);
static OUTPUT: AtomicUsize = AtomicUsize::new(0);

/// Default sink: raw `write(2)` so it stays async-signal safe. A null
/// output selects standard error; anything else is a raw file descriptor
/// smuggled through the pointer.
pub fn default_show(buf: &[u8], output: *mut c_void) -> usize {
    let fd = if output.is_null() {
        libc::STDERR_FILENO
    } else {
        output as usize as libc::c_int
    };
    let mut written = 0;
    while written < buf.len() {
        let n = unsafe {
            libc::write(
                fd,
                buf[written..].as_ptr() as *const c_void,
                buf.len() - written,
            )
        };
        if n <= 0 {
            break;
        }
        written += n as usize;
    }
    written
}

/// Default line rendering: `location: [order seconds] label: message`.
/// Seconds carry microsecond precision on wide platforms, millisecond on
/// narrow ones.
pub fn default_format(
    show: ShowFn,
    output: *mut c_void,
    label: &str,
    location: &str,
    order: u64,
    timestamp: u64,
    message: &[u8],
) {
    use std::fmt::Write as _;

    let mut out = [0u8; 512];
    let mut buf = Buf::new(&mut out);
    let secs = timestamp as f64 / TICKS_PER_SEC as f64;
    let _ = if TICKS_PER_SEC == 1_000_000 {
        write!(buf, "{location}: [{order} {secs:.6}] {label}: ")
    } else {
        write!(buf, "{location}: [{order} {secs:.3}] {label}: ")
    };
    buf.push_bytes(message);
    show(buf.bytes(), output);
}

fn current_show() -> ShowFn {
    match SHOW.load(Ordering::Relaxed) {
        0 => default_show,
        f => unsafe { mem::transmute::<usize, ShowFn>(f) },
    }
}

fn current_format() -> FormatFn {
    match FORMAT.load(Ordering::Relaxed) {
        0 => default_format,
        f => unsafe { mem::transmute::<usize, FormatFn>(f) },
    }
}

fn current_output() -> *mut c_void {
    OUTPUT.load(Ordering::Relaxed) as *mut c_void
}

/// Replace the sink writer, returning the previous one.
pub fn configure_show(show: ShowFn) -> ShowFn {
    match SHOW.swap(show as usize, Ordering::Relaxed) {
        0 => default_show,
        f => unsafe { mem::transmute::<usize, ShowFn>(f) },
    }
}

/// Replace the entry formatter, returning the previous one.
pub fn configure_format(format: FormatFn) -> FormatFn {
    match FORMAT.swap(format as usize, Ordering::Relaxed) {
        0 => default_format,
        f => unsafe { mem::transmute::<usize, FormatFn>(f) },
    }
}

/// Replace the opaque sink argument, returning the previous one.
pub fn configure_output(output: *mut c_void) -> *mut c_void {
    OUTPUT.swap(output as usize, Ordering::Relaxed) as *mut c_void
}

/// Compile a pattern that must fully match a name, case-insensitive.
pub(crate) fn full_match_regex(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("(?i)^(?:{pattern})$"))
}

pub(crate) fn dump_entry(
    label: &str,
    entry: &Entry,
    format: FormatFn,
    show: ShowFn,
    output: *mut c_void,
) {
    let mut msg = [0u8; 256];
    let len = format_entry_message(entry, &mut msg);
    format(
        show,
        output,
        label,
        entry.location,
        entry.order,
        entry.timestamp,
        &msg[..len],
    );
}

/// Called from the emit path when tracing is enabled on a recorder: print
/// synchronously unless the recorder is export-only, and push each exported
/// argument slot to its channel.
pub(crate) fn trace_entry(rec: &Recorder, entry: &Entry) {
    if rec.trace() != TRACE_EXPORTED {
        dump_entry(
            rec.name(),
            entry,
            current_format(),
            current_show(),
            current_output(),
        );
    }
    for (i, slot) in rec.exported.iter().enumerate() {
        let export = slot.load(Ordering::Acquire);
        if !export.is_null() {
            unsafe { (*export).push_sample(entry.timestamp, entry.args[i], entry.format, i) };
        }
    }
}

/// Merge-dump every recorder whose name fully matches `pattern`, in global
/// order, through the given hooks. Returns the number of entries emitted.
///
/// Producers may keep emitting concurrently: an entry lost to overrun
/// between the peek and the read is skipped, never double-counted.
pub fn sort(pattern: &str, format: FormatFn, show: ShowFn, output: *mut c_void) -> usize {
    let re = match full_match_regex(pattern) {
        Ok(re) => re,
        Err(_) => return 0,
    };
    let mut dumped = 0;
    loop {
        let mut lowest: Option<&'static Recorder> = None;
        let mut lowest_order = u64::MAX;
        for rec in recorders() {
            if !re.is_match(rec.name()) {
                continue;
            }
            if rec.readable() == 0 {
                continue;
            }
            if let Some(entry) = rec.peek() {
                if entry.order < lowest_order {
                    lowest_order = entry.order;
                    lowest = Some(rec);
                }
            }
        }
        let Some(rec) = lowest else {
            break;
        };
        match rec.read_one() {
            // Overrun since the peek: skip and re-evaluate.
            Err(_) | Ok(None) => continue,
            Ok(Some(entry)) => {
                dump_entry(rec.name(), &entry, format, show, output);
                dumped += 1;
            }
        }
    }
    dumped
}

/// Merge-dump every recorder through the current hooks.
pub fn dump() -> usize {
    sort(".*", current_format(), current_show(), current_output())
}

/// Merge-dump the recorders fully matching `pattern` through the current
/// hooks.
pub fn dump_for(pattern: &str) -> usize {
    sort(pattern, current_format(), current_show(), current_output())
}

crate::tweak!(
    pub(crate) DUMP_SLEEP,
    "recorder_dump_sleep",
    100,
    "Sleep time between background dumps (ms)"
);

static BACKGROUND_RUNNING: AtomicBool = AtomicBool::new(false);
static BACKGROUND_THREAD: Mutex<Option<thread::JoinHandle<()>>> = Mutex::new(None);

/// Start a thread that keeps merge-dumping the matching recorders, sleeping
/// for the `recorder_dump_sleep` tweak whenever a pass finds nothing.
pub fn background_dump(pattern: &str) {
    let what = if pattern == "all" { ".*" } else { pattern }.to_string();
    if BACKGROUND_RUNNING.swap(true, Ordering::SeqCst) {
        return;
    }
    let handle = thread::spawn(move || {
        while BACKGROUND_RUNNING.load(Ordering::Relaxed) {
            let dumped = sort(&what, current_format(), current_show(), current_output());
            if dumped == 0 {
                let ms = DUMP_SLEEP.value().max(0) as u64;
                thread::sleep(Duration::from_millis(ms));
            }
        }
    });
    *BACKGROUND_THREAD.lock().unwrap() = Some(handle);
}

/// Stop the background dumper and wait for its current pass to finish.
pub fn background_dump_stop() {
    BACKGROUND_RUNNING.store(false, Ordering::SeqCst);
    let handle = BACKGROUND_THREAD.lock().unwrap().take();
    if let Some(handle) = handle {
        let _ = handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_match_regex_is_anchored() {
        let re = full_match_regex("foo").unwrap();
        assert!(re.is_match("foo"));
        assert!(re.is_match("FOO"));
        assert!(!re.is_match("foobar"));
        assert!(!re.is_match("barfoo"));
        let re = full_match_regex("rec_.*").unwrap();
        assert!(re.is_match("rec_one"));
        assert!(!re.is_match("other_rec_one"));
    }

    #[test]
    fn test_invalid_pattern_dumps_nothing() {
        assert_eq!(dump_for("("), 0);
    }
}
