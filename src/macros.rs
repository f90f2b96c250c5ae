//! Definition and call-site macros.
//!
//! `recorder!` and `tweak!` declare lazily registered process-lifetime
//! handles; `record!` is the call-site sugar that stamps the location and
//! captures up to four word-sized arguments.

/// The call site as a `file:line` string with static lifetime.
#[macro_export]
macro_rules! location {
    () => {
        concat!(file!(), ":", line!())
    };
}

/// Declare a recorder handle:
/// `recorder!(PAGE_FAULTS, "page_faults", 256, "Page fault events");`
///
/// The first use registers the recorder; after that every `record!` through
/// the handle is lock-free and allocation-free. Touch the handle during
/// startup when the first event may come from a signal handler.
#[macro_export]
macro_rules! recorder {
    ($vis:vis $ident:ident, $name:literal, $size:expr, $description:literal) => {
        $vis static $ident: $crate::recorder::RecorderHandle =
            $crate::recorder::RecorderHandle::new($name, $size, $description);
    };
}

/// Declare a tweak handle:
/// `tweak!(RETRY_LIMIT, "retry_limit", 3, "Retries before giving up");`
#[macro_export]
macro_rules! tweak {
    ($vis:vis $ident:ident, $name:literal, $value:expr, $description:literal) => {
        $vis static $ident: $crate::config::TweakHandle =
            $crate::config::TweakHandle::new($name, $value, $description);
    };
}

/// Record one event:
/// `record!(PAGE_FAULTS, "fault at %p after %u accesses", addr, count);`
///
/// Arguments beyond the entry's slot count are dropped. `%s` arguments must
/// be `&'static CStr` (or a raw pointer to a stable NUL-terminated string).
#[macro_export]
macro_rules! record {
    ($rec:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $rec.get().emit(
            $crate::location!(),
            $fmt,
            &[$($crate::recorder::RecordArg::to_word($arg)),*],
        )
    };
}
