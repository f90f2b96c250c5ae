//! Tweaks and the trace/tweak configuration language.
//!
//! A configuration string, typically taken from `RECORDER_TRACES` or
//! `RECORDER_TWEAKS`, is a colon- or space-separated list of directives:
//!
//! ```text
//! NAME             enable tracing (value 1)
//! NAME=INTEGER     set trace level / tweak value (decimal, octal, hex)
//! NAME=STRING      export argument slots under the given channel names
//! help | list      print recorders and tweaks with current values
//! all              alias for the pattern ".*"
//! share=PATH       (re)create the shared channel file at PATH
//! ```
//!
//! `NAME` is a case-insensitive pattern that must fully match a recorder or
//! tweak name. Errors are reported through the returned status but never
//! abort the remaining directives.

use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, Ordering};
use std::sync::{Mutex, Once, OnceLock};

use crate::chans::{ChanData, ChanType, Chans, Export};
use crate::dump::full_match_regex;
use crate::recorder::{recorders, Recorder, ENTRY_ARGS, TRACE_EXPORTED};

/// Outcome of applying a configuration string. Directives keep being
/// processed after an error; the last error wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStatus {
    Ok,
    InvalidName,
    InvalidValue,
}

/// A named runtime-mutable integer, reachable from the configuration
/// language. Process lifetime, registered once.
pub struct Tweak {
    name: &'static str,
    description: &'static str,
    value: AtomicIsize,
    next: AtomicPtr<Tweak>,
}

static TWEAKS: AtomicPtr<Tweak> = AtomicPtr::new(ptr::null_mut());

impl Tweak {
    pub fn define(name: &'static str, value: isize, description: &'static str) -> &'static Tweak {
        let tweak = Box::leak(Box::new(Tweak {
            name,
            description,
            value: AtomicIsize::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        register_tweak(tweak);
        tweak
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    pub fn value(&self) -> isize {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: isize) -> isize {
        self.value.swap(value, Ordering::Relaxed)
    }
}

/// Link a tweak into the global list. Registering the same tweak twice is a
/// caller bug.
pub fn register_tweak(tweak: &'static Tweak) {
    let node = tweak as *const Tweak as *mut Tweak;
    let mut head = TWEAKS.load(Ordering::Acquire);
    loop {
        tweak.next.store(head, Ordering::Relaxed);
        match TWEAKS.compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(h) => head = h,
        }
    }
}

pub(crate) struct Tweaks {
    cur: *const Tweak,
}

impl Iterator for Tweaks {
    type Item = &'static Tweak;

    fn next(&mut self) -> Option<&'static Tweak> {
        if self.cur.is_null() {
            return None;
        }
        let tweak = unsafe { &*self.cur };
        self.cur = tweak.next.load(Ordering::Acquire);
        Some(tweak)
    }
}

pub(crate) fn tweaks() -> Tweaks {
    Tweaks {
        cur: TWEAKS.load(Ordering::Acquire),
    }
}

/// Lazily registered tweak declared by the `tweak!` macro.
pub struct TweakHandle {
    name: &'static str,
    description: &'static str,
    initial: isize,
    cell: OnceLock<&'static Tweak>,
}

impl TweakHandle {
    pub const fn new(name: &'static str, initial: isize, description: &'static str) -> Self {
        TweakHandle {
            name,
            description,
            initial,
            cell: OnceLock::new(),
        }
    }

    pub fn get(&self) -> &'static Tweak {
        self.cell
            .get_or_init(|| Tweak::define(self.name, self.initial, self.description))
    }

    pub fn value(&self) -> isize {
        self.get().value()
    }

    pub fn set(&self, value: isize) -> isize {
        self.get().set(value)
    }
}

crate::recorder!(TRACES, "recorder_traces", 64, "Setting recorder traces");
crate::tweak!(
    EXPORT_SIZE,
    "recorder_export_size",
    2048,
    "Number of samples stored when exporting records"
);

/// Path of the shared channel file: `RECORDER_SHARE` or the default.
pub fn export_file() -> String {
    std::env::var("RECORDER_SHARE").unwrap_or_else(|_| "/tmp/recorder_share".to_string())
}

/// The process-wide export set, created lazily on first export and torn
/// down at exit. Boxed so the per-recorder export hooks can keep a stable
/// pointer to it.
static EXPORT: Mutex<Option<Box<Chans>>> = Mutex::new(None);
static ATEXIT: Once = Once::new();

extern "C" {
    fn atexit(cb: extern "C" fn()) -> libc::c_int;
}

extern "C" fn atexit_cleanup() {
    share(None);
}

fn export_lock() -> std::sync::MutexGuard<'static, Option<Box<Chans>>> {
    EXPORT.lock().unwrap_or_else(|e| e.into_inner())
}

/// Replace the export set: tear down the current one (detaching every
/// recorder), then create a fresh file at `path` if given.
pub(crate) fn share(path: Option<&str>) {
    let mut guard = export_lock();
    if let Some(old) = guard.take() {
        old.delete();
    }
    let Some(path) = path else {
        return;
    };
    match Chans::create(path) {
        Ok(chans) => {
            *guard = Some(chans);
            ATEXIT.call_once(|| {
                unsafe { atexit(atexit_cleanup) };
            });
        }
        // Open or map failure disables export for this invocation only.
        Err(_) => {}
    }
}

/// Export up to [`ENTRY_ARGS`] argument slots of `rec` under comma-separated
/// channel names. With `multi`, names are disambiguated as
/// `recorder/name`. Export alone does not enable synchronous printing: a
/// recorder whose trace was off is moved to the exported-only sentinel.
fn export(rec: &'static Recorder, names: &str, multi: bool) {
    let mut guard = export_lock();
    if guard.is_none() {
        drop(guard);
        share(Some(&export_file()));
        guard = export_lock();
    }
    let Some(chans) = guard.as_mut() else {
        return;
    };
    let chans_ptr: *const Chans = &**chans;

    for (t, name) in names.split(',').take(ENTRY_ARGS).enumerate() {
        let old = rec.exported[t].swap(ptr::null_mut(), Ordering::AcqRel);
        if !old.is_null() {
            let old = unsafe { Box::from_raw(old) };
            chans.chan_delete(old.chan());
        }

        let size = EXPORT_SIZE.value().max(1) as u64;
        let chan_name = if multi {
            format!("{}/{}", rec.name(), name)
        } else {
            name.to_string()
        };
        println!(
            "Exporting recorder channel {} for index {} in {}",
            chan_name,
            t,
            rec.name()
        );
        match chans.chan_new(
            ChanType::None,
            size,
            &chan_name,
            rec.description(),
            "",
            ChanData::signed(0),
            ChanData::signed(0),
        ) {
            Ok(chan) => {
                let export = Box::new(Export::new(chans_ptr, chan));
                rec.exported[t].store(Box::into_raw(export), Ordering::Release);
                if rec.trace() == 0 {
                    rec.set_trace(TRACE_EXPORTED);
                }
            }
            Err(_) => {}
        }
    }
}

/// Integer parsing with `strtol(…, 0)` semantics: decimal, octal via a
/// leading 0, hex via 0x. Returns the parsed prefix and whether the whole
/// string was consumed.
fn parse_c_int(s: &str) -> (isize, bool) {
    let bytes = s.as_bytes();
    let (base, start) = if bytes.len() > 2 && bytes[0] == b'0' && (bytes[1] | 0x20) == b'x' {
        (16u32, 2)
    } else if bytes.len() > 1 && bytes[0] == b'0' {
        (8u32, 1)
    } else {
        (10u32, 0)
    };
    let mut value: isize = 0;
    let mut end = start;
    while end < bytes.len() {
        match (bytes[end] as char).to_digit(base) {
            Some(d) => {
                value = value.wrapping_mul(base as isize).wrapping_add(d as isize);
                end += 1;
            }
            None => break,
        }
    }
    (value, end == bytes.len())
}

fn list_recorders_and_tweaks() {
    println!("List of available recorders:");
    for rec in recorders() {
        println!(
            "{:>20}{}: {}",
            rec.name(),
            if rec.trace() != 0 { "*" } else { " " },
            rec.description()
        );
    }
    println!("List of available tweaks:");
    for tweak in tweaks() {
        println!(
            "{:>20} : {} = {} (0x{:X})",
            tweak.name(),
            tweak.description(),
            tweak.value(),
            tweak.value()
        );
    }
}

fn apply_directive(name: &str, value: Option<&str>, rc: &mut TraceStatus) {
    // A bare NAME means 1; a value starting with a digit is numeric;
    // anything else is a list of export channel names.
    let numerical = match value {
        None => true,
        Some(v) => v.bytes().next().is_some_and(|b| b.is_ascii_digit()),
    };
    let pattern = if name == "all" { ".*" } else { name };
    let re = match full_match_regex(pattern) {
        Ok(re) => re,
        Err(_) => {
            *rc = TraceStatus::InvalidName;
            crate::record!(TRACES, "Invalid name pattern of %u bytes", name.len());
            return;
        }
    };

    if numerical {
        let val = match value {
            None => 1,
            Some(v) => {
                let (val, ok) = parse_c_int(v);
                if !ok {
                    *rc = TraceStatus::InvalidValue;
                    crate::record!(TRACES, "Invalid numerical value, using prefix %ld", val);
                }
                val
            }
        };
        for rec in recorders() {
            if re.is_match(rec.name()) {
                crate::record!(
                    TRACES,
                    "Set recorder %p from %ld to %ld",
                    rec as *const Recorder,
                    rec.trace(),
                    val
                );
                rec.set_trace(val);
            }
        }
        for tweak in tweaks() {
            if re.is_match(tweak.name()) {
                crate::record!(
                    TRACES,
                    "Set tweak %p from %ld to %ld",
                    tweak as *const Tweak,
                    tweak.value(),
                    val
                );
                tweak.set(val);
            }
        }
    } else {
        let names = value.unwrap_or("");
        let matches = recorders().filter(|r| re.is_match(r.name())).count();
        for rec in recorders() {
            if re.is_match(rec.name()) {
                export(rec, names, matches > 1);
            }
        }
    }
}

/// Make sure every built-in recorder and tweak is registered before names
/// are matched, so directives can reach them on first use.
fn register_builtin_handles() {
    TRACES.get();
    EXPORT_SIZE.get();
    crate::dump::DUMP_SLEEP.get();
    crate::signal::SIGNALS.get();
    crate::signal::SIGNAL_MASK.get();
    crate::chans::DELETING.get();
}

/// Apply a configuration string. Invalid directives are reported in the
/// returned status and recorded, but the remaining directives still run.
pub fn trace_set(spec: &str) -> TraceStatus {
    register_builtin_handles();
    let mut rc = TraceStatus::Ok;
    crate::record!(TRACES, "Setting traces from a %u byte spec", spec.len());

    for directive in spec.split([':', ' ']) {
        if directive.is_empty() {
            continue;
        }
        let (name, value) = match directive.split_once('=') {
            Some((n, v)) => (n, Some(v)),
            None => (directive, None),
        };
        match name {
            "help" | "list" => list_recorders_and_tweaks(),
            "share" => share(value),
            _ => apply_directive(name, value, &mut rc),
        }
    }
    rc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_c_int() {
        assert_eq!(parse_c_int("42"), (42, true));
        assert_eq!(parse_c_int("0x1f"), (31, true));
        assert_eq!(parse_c_int("0X1F"), (31, true));
        assert_eq!(parse_c_int("017"), (15, true));
        assert_eq!(parse_c_int("0"), (0, true));
        assert_eq!(parse_c_int("5x"), (5, false));
        assert_eq!(parse_c_int("08"), (0, false));
    }

    #[test]
    fn test_trace_set_numeric_and_status() {
        let rec = Recorder::define("config_unit_rec", 8, "unit test recorder");
        assert_eq!(trace_set("config_unit_rec=3"), TraceStatus::Ok);
        assert_eq!(rec.trace(), 3);
        assert_eq!(trace_set("config_unit_rec=0"), TraceStatus::Ok);
        assert_eq!(rec.trace(), 0);
        // Pattern matching is case-insensitive and anchored.
        assert_eq!(trace_set("CONFIG_UNIT_R.*=2"), TraceStatus::Ok);
        assert_eq!(rec.trace(), 2);
        trace_set("config_unit_rec=0");
    }

    #[test]
    fn test_trace_set_errors_do_not_abort() {
        let rec = Recorder::define("config_err_rec", 8, "unit test recorder");
        assert_eq!(trace_set("(=1:config_err_rec=7"), TraceStatus::InvalidName);
        assert_eq!(rec.trace(), 7);
        assert_eq!(trace_set("config_err_rec=5z:config_err_rec=9"), TraceStatus::InvalidValue);
        assert_eq!(rec.trace(), 9);
        trace_set("config_err_rec=0");
    }

    #[test]
    fn test_trace_set_tweak_by_name() {
        let tweak = Tweak::define("config_unit_tweak", 10, "unit test tweak");
        assert_eq!(trace_set("config_unit_tweak=0x20"), TraceStatus::Ok);
        assert_eq!(tweak.value(), 32);
    }

    #[test]
    fn test_trace_set_is_idempotent() {
        let rec = Recorder::define("config_idem_rec", 8, "unit test recorder");
        trace_set("config_idem_rec=4");
        let first = rec.trace();
        trace_set("config_idem_rec=4");
        assert_eq!(rec.trace(), first);
        trace_set("config_idem_rec=0");
    }
}
