//! Recorders, entries, and the emit hot path.
//!
//! A recorder is a named ring of fixed-size [`Entry`] records. Recorders are
//! registered once, live for the whole process, and are linked into a global
//! lock-free list that the dump machinery walks. Emitting is async-signal
//! safe: no locks, no allocation, no standard I/O.

use std::ffi::CStr;
use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::chans::Export;
use crate::ringbuf::{CatchUp, Ring};

/// Argument slots carried by one entry.
pub const ENTRY_ARGS: usize = 4;

/// Clock resolution: microseconds on wide platforms, milliseconds on narrow.
pub const TICKS_PER_SEC: u64 = if cfg!(target_pointer_width = "64") {
    1_000_000
} else {
    1_000
};

/// `trace` value meaning "push to export channels but do not print".
/// Shares its bit pattern with the shared-file magic so the sentinel is
/// recognisable in a raw dump of either.
pub const TRACE_EXPORTED: isize = crate::chans::CHAN_MAGIC as isize;

/// Ticks elapsed since the first call, in `1 / TICKS_PER_SEC` units.
pub fn tick() -> u64 {
    static INITIAL: AtomicU64 = AtomicU64::new(0);

    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    let now = if TICKS_PER_SEC == 1_000_000 {
        ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
    } else {
        ts.tv_sec as u64 * 1_000 + ts.tv_nsec as u64 / 1_000_000
    };
    if INITIAL.load(Ordering::Relaxed) == 0 {
        let _ = INITIAL.compare_exchange(0, now, Ordering::AcqRel, Ordering::Relaxed);
    }
    now.saturating_sub(INITIAL.load(Ordering::Relaxed))
}

/// One recorded event. `location` and `format` are stable-lifetime strings
/// captured at the call site; `args` are word-sized slots whose meaning is
/// recovered from the format string when the entry is printed.
#[derive(Clone, Copy)]
pub struct Entry {
    pub timestamp: u64,
    pub order: u64,
    pub location: &'static str,
    pub format: &'static str,
    pub args: [usize; ENTRY_ARGS],
}

impl Default for Entry {
    fn default() -> Self {
        Entry {
            timestamp: 0,
            order: 0,
            location: "",
            format: "",
            args: [0; ENTRY_ARGS],
        }
    }
}

/// A named flight recorder: a ring of entries plus trace/export state.
pub struct Recorder {
    name: &'static str,
    description: &'static str,
    /// 0 = off, nonzero = print synchronously (the value doubles as a
    /// level for call sites that want one), [`TRACE_EXPORTED`] = export
    /// only. Read on every emit with relaxed ordering: a concurrent
    /// `trace_set` may be observed one entry late.
    pub(crate) trace: AtomicIsize,
    pub(crate) exported: [AtomicPtr<Export>; ENTRY_ARGS],
    pub(crate) ring: Ring<Entry>,
    next: AtomicPtr<Recorder>,
}

/// Head of the global recorder list. Push-only: nodes are never removed.
static RECORDERS: AtomicPtr<Recorder> = AtomicPtr::new(ptr::null_mut());

/// Process-wide order counter: drawn once per emit, before the payload is
/// committed, so it totally orders entries across all recorders.
static RECORDER_ORDER: AtomicU64 = AtomicU64::new(0);

impl Recorder {
    /// Allocate and register a recorder. Call once per name, at startup;
    /// the returned reference lives for the rest of the process.
    pub fn define(name: &'static str, size: usize, description: &'static str) -> &'static Recorder {
        let rec = Box::leak(Box::new(Recorder {
            name,
            description,
            trace: AtomicIsize::new(0),
            exported: Default::default(),
            ring: Ring::new(size),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        register(rec);
        rec
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    pub fn trace(&self) -> isize {
        self.trace.load(Ordering::Relaxed)
    }

    pub fn set_trace(&self, value: isize) -> isize {
        self.trace.swap(value, Ordering::Relaxed)
    }

    /// Entries committed and not yet consumed by the dump cursor.
    pub fn readable(&self) -> u64 {
        self.ring.readable()
    }

    pub(crate) fn peek(&self) -> Option<Entry> {
        self.ring.peek()
    }

    pub(crate) fn read_one(&self) -> Result<Option<Entry>, CatchUp> {
        let mut out = [Entry::default()];
        match self.ring.read(&mut out)? {
            0 => Ok(None),
            _ => Ok(Some(out[0])),
        }
    }

    /// The emit hot path: stamp, order, write to the ring, and hand the
    /// entry to the trace/export machinery when tracing is on. Lock-free,
    /// allocation-free, async-signal safe.
    pub fn emit(&self, location: &'static str, format: &'static str, args: &[usize]) {
        let timestamp = tick();
        let order = RECORDER_ORDER.fetch_add(1, Ordering::AcqRel);
        let mut entry = Entry {
            timestamp,
            order,
            location,
            format,
            args: [0; ENTRY_ARGS],
        };
        let n = args.len().min(ENTRY_ARGS);
        entry.args[..n].copy_from_slice(&args[..n]);
        self.ring.write(std::slice::from_ref(&entry));

        if self.trace.load(Ordering::Relaxed) != 0 {
            crate::dump::trace_entry(self, &entry);
        }
    }
}

/// Link a recorder into the global list. Registering the same recorder
/// twice is a caller bug.
pub fn register(recorder: &'static Recorder) {
    let node = recorder as *const Recorder as *mut Recorder;
    let mut head = RECORDERS.load(Ordering::Acquire);
    loop {
        recorder.next.store(head, Ordering::Relaxed);
        match RECORDERS.compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(h) => head = h,
        }
    }
}

pub(crate) struct Recorders {
    cur: *const Recorder,
}

impl Iterator for Recorders {
    type Item = &'static Recorder;

    fn next(&mut self) -> Option<&'static Recorder> {
        if self.cur.is_null() {
            return None;
        }
        let rec = unsafe { &*self.cur };
        self.cur = rec.next.load(Ordering::Acquire);
        Some(rec)
    }
}

/// Walk every registered recorder, newest first. Safe against concurrent
/// registration: new nodes appear at the head with `next` fully set.
pub(crate) fn recorders() -> Recorders {
    Recorders {
        cur: RECORDERS.load(Ordering::Acquire),
    }
}

/// Conversion of call-site arguments into word-sized entry slots. Floats
/// are stored as their bit pattern in the word width the platform uses for
/// one slot; the formatter reverses this from the conversion specifier.
pub trait RecordArg {
    fn to_word(self) -> usize;
}

macro_rules! int_record_arg {
    ($($t:ty),*) => {
        $(impl RecordArg for $t {
            fn to_word(self) -> usize {
                self as usize
            }
        })*
    };
}

int_record_arg!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl RecordArg for bool {
    fn to_word(self) -> usize {
        self as usize
    }
}

impl RecordArg for char {
    fn to_word(self) -> usize {
        self as usize
    }
}

impl RecordArg for f64 {
    #[cfg(target_pointer_width = "64")]
    fn to_word(self) -> usize {
        self.to_bits() as usize
    }

    #[cfg(target_pointer_width = "32")]
    fn to_word(self) -> usize {
        (self as f32).to_bits() as usize
    }
}

impl RecordArg for f32 {
    #[cfg(target_pointer_width = "64")]
    fn to_word(self) -> usize {
        (self as f64).to_bits() as usize
    }

    #[cfg(target_pointer_width = "32")]
    fn to_word(self) -> usize {
        self.to_bits() as usize
    }
}

impl<T> RecordArg for *const T {
    fn to_word(self) -> usize {
        self as usize
    }
}

impl<T> RecordArg for *mut T {
    fn to_word(self) -> usize {
        self as usize
    }
}

/// `%s` slots hold a pointer to a NUL-terminated string that outlives every
/// dump, which `&'static CStr` guarantees.
impl RecordArg for &'static CStr {
    fn to_word(self) -> usize {
        self.as_ptr() as usize
    }
}

/// Lazily registered recorder declared by the `recorder!` macro. The first
/// touch performs the single registration; after that `get` is a plain
/// atomic load and the emit path never allocates.
pub struct RecorderHandle {
    name: &'static str,
    description: &'static str,
    size: usize,
    cell: OnceLock<&'static Recorder>,
}

impl RecorderHandle {
    pub const fn new(name: &'static str, size: usize, description: &'static str) -> Self {
        RecorderHandle {
            name,
            description,
            size,
            cell: OnceLock::new(),
        }
    }

    pub fn get(&self) -> &'static Recorder {
        self.cell
            .get_or_init(|| Recorder::define(self.name, self.size, self.description))
    }
}
