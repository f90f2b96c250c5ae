//! Non-blocking in-process flight recorder.
//!
//! Application threads record structured events into per-recorder lock-free
//! rings at very high frequency, without blocking, allocating, or taking
//! locks, including from signal handlers. Recorded events can be dumped on
//! demand, on a crash signal, or continuously from a background thread, as
//! a single stream globally ordered across all recorders. Selected numeric
//! argument streams can additionally be published into a memory-mapped file
//! that another process subscribes to and polls live.
//!
//! # Recording and dumping
//!
//! ```no_run
//! use flightrec::{record, recorder};
//!
//! recorder!(REQUESTS, "requests", 256, "Incoming requests");
//!
//! fn handle(id: u64, latency_us: u64) {
//!     record!(REQUESTS, "request %lu served in %lu us", id, latency_us);
//! }
//!
//! fn main() {
//!     // Honour RECORDER_TRACES / RECORDER_TWEAKS / RECORDER_DUMP and dump
//!     // on the common crash signals.
//!     flightrec::dump_on_common_signals(0, 0);
//!     handle(1, 42);
//!     flightrec::dump();
//! }
//! ```
//!
//! # Configuration
//!
//! Tracing, tweaks and exports are driven by a small directive language
//! (see [`trace_set`]), typically supplied through the `RECORDER_TRACES`
//! and `RECORDER_TWEAKS` environment variables. `RECORDER_SHARE` overrides
//! the shared channel file path, `RECORDER_DUMP` starts the background
//! dumper on the given recorder pattern.

pub mod chans;
pub mod config;
pub mod dump;
mod format;
mod macros;
pub mod recorder;
pub mod ringbuf;
pub mod signal;

pub use chans::{Chan, ChanData, ChanType, Chans, Sample, CHAN_MAGIC, CHAN_VERSION};
pub use config::{export_file, register_tweak, trace_set, TraceStatus, Tweak, TweakHandle};
pub use dump::{
    background_dump, background_dump_stop, configure_format, configure_output, configure_show,
    default_format, default_show, dump, dump_for, sort, FormatFn, ShowFn,
};
pub use recorder::{
    register as register_recorder, tick, Entry, RecordArg, Recorder, RecorderHandle, ENTRY_ARGS,
    TICKS_PER_SEC, TRACE_EXPORTED,
};
pub use ringbuf::{CatchUp, RawRing, Ring};
pub use signal::{dump_on_common_signals, dump_on_signal};
